use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::api::FlagError;
use crate::flag_definitions::{Flag, FlagUpdate, KillSwitch, KillSwitchScope, TenantOverride};
use crate::store::FlagStore;

/// Write-side policy over the store contract. Every management caller goes
/// through here so the guards (required fields, no flag deletion, attributed
/// kill-switch flips) cannot be bypassed by reaching for the store directly.
pub struct FlagManager {
    store: Arc<dyn FlagStore + Send + Sync>,
}

fn require_field(name: &'static str, value: &str) -> Result<(), FlagError> {
    if value.trim().is_empty() {
        return Err(FlagError::MissingField(name));
    }
    Ok(())
}

impl FlagManager {
    pub fn new(store: Arc<dyn FlagStore + Send + Sync>) -> Self {
        FlagManager { store }
    }

    /// Flag creation requires a key, a description, and an owner; the store
    /// rejects duplicates.
    pub async fn create_flag(
        &self,
        flag_key: &str,
        description: &str,
        owner: &str,
        default_enabled: bool,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Flag, FlagError> {
        require_field("flag_key", flag_key)?;
        require_field("description", description)?;
        require_field("owner", owner)?;

        let flag = Flag {
            flag_key: flag_key.to_string(),
            description: description.to_string(),
            default_enabled,
            owner: owner.to_string(),
            created_at: Utc::now(),
            expires_at,
        };
        self.store.create_flag(&flag).await?;
        tracing::info!(flag_key, owner, default_enabled, "flag created");
        Ok(flag)
    }

    pub async fn update_flag(
        &self,
        flag_key: &str,
        update: FlagUpdate,
    ) -> Result<Flag, FlagError> {
        let flag = self.store.update_flag(flag_key, &update).await?;
        tracing::info!(flag_key, "flag updated");
        Ok(flag)
    }

    /// Flags are append/mutate-only. Disable a flag (or flip its
    /// kill-switch) instead of deleting it.
    pub async fn delete_flag(&self, _flag_key: &str) -> Result<(), FlagError> {
        Err(FlagError::DeletionNotAllowed)
    }

    pub async fn set_tenant_override(
        &self,
        tenant_id: &str,
        flag_key: &str,
        enabled: bool,
        actor: &str,
    ) -> Result<TenantOverride, FlagError> {
        let tenant_override = TenantOverride {
            tenant_id: tenant_id.to_string(),
            flag_key: flag_key.to_string(),
            enabled,
            updated_at: Utc::now(),
            updated_by: actor.to_string(),
        };
        self.store.set_tenant_override(&tenant_override).await?;
        tracing::info!(tenant_id, flag_key, enabled, actor, "tenant override set");
        Ok(tenant_override)
    }

    pub async fn remove_tenant_override(
        &self,
        tenant_id: &str,
        flag_key: &str,
        actor: &str,
    ) -> Result<(), FlagError> {
        self.store
            .remove_tenant_override(tenant_id, flag_key)
            .await?;
        tracing::info!(tenant_id, flag_key, actor, "tenant override removed");
        Ok(())
    }

    /// `flag_key` of `None` selects the global scope. Both activation and
    /// deactivation require a reason and an actor.
    pub async fn activate_kill_switch(
        &self,
        flag_key: Option<&str>,
        reason: &str,
        actor: &str,
    ) -> Result<KillSwitch, FlagError> {
        self.set_kill_switch(flag_key, true, reason, actor).await
    }

    pub async fn deactivate_kill_switch(
        &self,
        flag_key: Option<&str>,
        reason: &str,
        actor: &str,
    ) -> Result<KillSwitch, FlagError> {
        self.set_kill_switch(flag_key, false, reason, actor).await
    }

    async fn set_kill_switch(
        &self,
        flag_key: Option<&str>,
        enabled: bool,
        reason: &str,
        actor: &str,
    ) -> Result<KillSwitch, FlagError> {
        require_field("reason", reason)?;
        require_field("actor", actor)?;

        let scope = match flag_key {
            Some(key) => KillSwitchScope::Flag(key.to_string()),
            None => KillSwitchScope::Global,
        };
        let kill_switch = KillSwitch {
            scope: scope.clone(),
            enabled,
            reason: reason.to_string(),
            activated_at: Utc::now(),
            activated_by: actor.to_string(),
        };
        self.store.set_kill_switch(&kill_switch).await?;
        tracing::warn!(?scope, enabled, reason, actor, "kill-switch state changed");
        Ok(kill_switch)
    }

    pub async fn list_flags(&self) -> Result<Vec<Flag>, FlagError> {
        Ok(self.store.list_flags().await?)
    }

    pub async fn batch_get_flags(&self, flag_keys: &[String]) -> Result<Vec<Flag>, FlagError> {
        Ok(self.store.batch_get_flags(flag_keys).await?)
    }
}
