use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::flag_definitions::{Flag, FlagUpdate, KillSwitch, KillSwitchScope, TenantOverride};

/// Classified failure from the backing store. The evaluator absorbs all of
/// these into the fail-closed default; the management layer surfaces them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("item not found")]
    NotFound,
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("conditional check failed: {0}")]
    ConditionalCheckFailed(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unclassified store error: {0}")]
    Unknown(String),
}

impl StoreError {
    /// Stable classification label, used in structured log records.
    pub fn classification(&self) -> &'static str {
        match self {
            StoreError::NotFound => "not_found",
            StoreError::AccessDenied(_) => "access_denied",
            StoreError::Throttled(_) => "throttled",
            StoreError::ConditionalCheckFailed(_) => "conditional_check_failed",
            StoreError::Validation(_) => "validation",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Unknown(_) => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Throttled(_) | StoreError::Unavailable(_))
    }
}

/// Contract the evaluator needs from the persistent flag store.
///
/// Reads return `Ok(None)` for absent items. Writes carry no version token:
/// two concurrent updates to the same key are last-writer-wins with no
/// conflict detection.
#[async_trait]
pub trait FlagStore {
    async fn get_flag(&self, flag_key: &str) -> Result<Option<Flag>, StoreError>;

    async fn get_tenant_override(
        &self,
        tenant_id: &str,
        flag_key: &str,
    ) -> Result<Option<TenantOverride>, StoreError>;

    async fn get_kill_switch(
        &self,
        scope: &KillSwitchScope,
    ) -> Result<Option<KillSwitch>, StoreError>;

    /// Fails with [`StoreError::ConditionalCheckFailed`] if the key exists.
    async fn create_flag(&self, flag: &Flag) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] if the flag does not exist.
    async fn update_flag(&self, flag_key: &str, update: &FlagUpdate) -> Result<Flag, StoreError>;

    /// Upsert, no existence precondition.
    async fn set_tenant_override(&self, tenant_override: &TenantOverride)
        -> Result<(), StoreError>;

    /// Idempotent: removing an absent override succeeds.
    async fn remove_tenant_override(
        &self,
        tenant_id: &str,
        flag_key: &str,
    ) -> Result<(), StoreError>;

    /// Upsert, scope selected by the switch itself.
    async fn set_kill_switch(&self, kill_switch: &KillSwitch) -> Result<(), StoreError>;

    async fn list_flags(&self) -> Result<Vec<Flag>, StoreError>;

    async fn batch_get_flags(&self, flag_keys: &[String]) -> Result<Vec<Flag>, StoreError>;
}

/// In-process [`FlagStore`] used as the swappable test double.
///
/// Tracks how many read operations were issued and can be told to fail every
/// operation with a canned error, which is how the fail-closed paths get
/// exercised without a real backend.
#[derive(Default)]
pub struct MemoryFlagStore {
    flags: DashMap<String, Flag>,
    overrides: DashMap<(String, String), TenantOverride>,
    kill_switches: DashMap<KillSwitchScope, KillSwitch>,
    reads: AtomicU64,
    fail_with: Mutex<Option<StoreError>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of read operations served since construction.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Make every subsequent operation fail with `error`; `None` heals it.
    pub fn fail_with(&self, error: Option<StoreError>) {
        *self.fail_with.lock().expect("store mutex poisoned") = error;
    }

    fn check_healthy(&self) -> Result<(), StoreError> {
        match &*self.fail_with.lock().expect("store mutex poisoned") {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn record_read(&self) -> Result<(), StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_healthy()
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn get_flag(&self, flag_key: &str) -> Result<Option<Flag>, StoreError> {
        self.record_read()?;
        Ok(self.flags.get(flag_key).map(|f| f.value().clone()))
    }

    async fn get_tenant_override(
        &self,
        tenant_id: &str,
        flag_key: &str,
    ) -> Result<Option<TenantOverride>, StoreError> {
        self.record_read()?;
        let key = (tenant_id.to_string(), flag_key.to_string());
        Ok(self.overrides.get(&key).map(|o| o.value().clone()))
    }

    async fn get_kill_switch(
        &self,
        scope: &KillSwitchScope,
    ) -> Result<Option<KillSwitch>, StoreError> {
        self.record_read()?;
        Ok(self.kill_switches.get(scope).map(|k| k.value().clone()))
    }

    async fn create_flag(&self, flag: &Flag) -> Result<(), StoreError> {
        self.check_healthy()?;
        if self.flags.contains_key(&flag.flag_key) {
            return Err(StoreError::ConditionalCheckFailed(format!(
                "flag '{}' already exists",
                flag.flag_key
            )));
        }
        self.flags.insert(flag.flag_key.clone(), flag.clone());
        Ok(())
    }

    async fn update_flag(&self, flag_key: &str, update: &FlagUpdate) -> Result<Flag, StoreError> {
        self.check_healthy()?;
        let mut entry = self.flags.get_mut(flag_key).ok_or(StoreError::NotFound)?;
        update.apply(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn set_tenant_override(
        &self,
        tenant_override: &TenantOverride,
    ) -> Result<(), StoreError> {
        self.check_healthy()?;
        let key = (
            tenant_override.tenant_id.clone(),
            tenant_override.flag_key.clone(),
        );
        self.overrides.insert(key, tenant_override.clone());
        Ok(())
    }

    async fn remove_tenant_override(
        &self,
        tenant_id: &str,
        flag_key: &str,
    ) -> Result<(), StoreError> {
        self.check_healthy()?;
        let key = (tenant_id.to_string(), flag_key.to_string());
        self.overrides.remove(&key);
        Ok(())
    }

    async fn set_kill_switch(&self, kill_switch: &KillSwitch) -> Result<(), StoreError> {
        self.check_healthy()?;
        self.kill_switches
            .insert(kill_switch.scope.clone(), kill_switch.clone());
        Ok(())
    }

    async fn list_flags(&self) -> Result<Vec<Flag>, StoreError> {
        self.record_read()?;
        let mut flags: Vec<Flag> = self.flags.iter().map(|f| f.value().clone()).collect();
        flags.sort_by(|a, b| a.flag_key.cmp(&b.flag_key));
        Ok(flags)
    }

    /// Missing keys are skipped rather than reported.
    async fn batch_get_flags(&self, flag_keys: &[String]) -> Result<Vec<Flag>, StoreError> {
        self.record_read()?;
        Ok(flag_keys
            .iter()
            .filter_map(|key| self.flags.get(key).map(|f| f.value().clone()))
            .collect())
    }
}
