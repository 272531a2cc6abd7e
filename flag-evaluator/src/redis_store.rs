use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::flag_definitions::{Flag, FlagUpdate, KillSwitch, KillSwitchScope, TenantOverride};
use crate::redis::{Client, CustomRedisError};
use crate::store::{FlagStore, StoreError};

/// [`FlagStore`] backed by redis, with every key namespaced by the
/// environment the store was constructed for. The prefix is fixed at
/// construction, so a store bound to `production` cannot read or write
/// staging keys no matter what the caller passes in.
pub struct RedisFlagStore {
    client: Arc<dyn Client + Send + Sync>,
    prefix: String,
}

impl RedisFlagStore {
    pub fn new(client: Arc<dyn Client + Send + Sync>, environment: &str) -> RedisFlagStore {
        RedisFlagStore {
            client,
            prefix: format!("flags:{environment}"),
        }
    }

    fn flag_key(&self, flag_key: &str) -> String {
        format!("{}:flag:{flag_key}", self.prefix)
    }

    fn flag_index_key(&self) -> String {
        format!("{}:flag_index", self.prefix)
    }

    fn override_key(&self, tenant_id: &str, flag_key: &str) -> String {
        format!("{}:override:{tenant_id}:{flag_key}", self.prefix)
    }

    fn kill_switch_key(&self, scope: &KillSwitchScope) -> String {
        match scope {
            KillSwitchScope::Global => format!("{}:killswitch:global", self.prefix),
            KillSwitchScope::Flag(flag_key) => {
                format!("{}:killswitch:flag:{flag_key}", self.prefix)
            }
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>, StoreError> {
        match self.client.get(key).await {
            Ok(raw) => {
                let item = serde_json::from_str(&raw).map_err(|e| {
                    tracing::error!("failed to parse stored item: {}", e);
                    StoreError::Validation(e.to_string())
                })?;
                Ok(Some(item))
            }
            Err(CustomRedisError::NotFound) => Ok(None),
            Err(e) => Err(classify_redis_error(e)),
        }
    }

    async fn write_json<T: Serialize>(&self, key: String, item: &T) -> Result<(), StoreError> {
        let raw = to_json(item)?;
        self.client
            .set(key, raw)
            .await
            .map_err(classify_redis_error)
    }
}

fn to_json<T: Serialize>(item: &T) -> Result<String, StoreError> {
    serde_json::to_string(item).map_err(|e| StoreError::Validation(e.to_string()))
}

fn classify_redis_error(err: CustomRedisError) -> StoreError {
    match err {
        CustomRedisError::NotFound => StoreError::NotFound,
        CustomRedisError::Timeout => StoreError::Unavailable("redis command timed out".to_string()),
        CustomRedisError::ParseError(message) => StoreError::Validation(message),
        CustomRedisError::Redis(e) => match e.kind() {
            redis::ErrorKind::AuthenticationFailed => StoreError::AccessDenied(e.to_string()),
            redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain => {
                StoreError::Throttled(e.to_string())
            }
            redis::ErrorKind::IoError
            | redis::ErrorKind::ClusterDown
            | redis::ErrorKind::MasterDown => StoreError::Unavailable(e.to_string()),
            redis::ErrorKind::TypeError => StoreError::Validation(e.to_string()),
            _ => StoreError::Unknown(e.to_string()),
        },
    }
}

#[async_trait]
impl FlagStore for RedisFlagStore {
    async fn get_flag(&self, flag_key: &str) -> Result<Option<Flag>, StoreError> {
        self.read_json(self.flag_key(flag_key)).await
    }

    async fn get_tenant_override(
        &self,
        tenant_id: &str,
        flag_key: &str,
    ) -> Result<Option<TenantOverride>, StoreError> {
        self.read_json(self.override_key(tenant_id, flag_key)).await
    }

    async fn get_kill_switch(
        &self,
        scope: &KillSwitchScope,
    ) -> Result<Option<KillSwitch>, StoreError> {
        self.read_json(self.kill_switch_key(scope)).await
    }

    async fn create_flag(&self, flag: &Flag) -> Result<(), StoreError> {
        let raw = to_json(flag)?;
        let created = self
            .client
            .set_nx(self.flag_key(&flag.flag_key), raw)
            .await
            .map_err(classify_redis_error)?;
        if !created {
            return Err(StoreError::ConditionalCheckFailed(format!(
                "flag '{}' already exists",
                flag.flag_key
            )));
        }
        self.client
            .sadd(self.flag_index_key(), flag.flag_key.clone())
            .await
            .map_err(classify_redis_error)
    }

    // Read-modify-write without a version token: concurrent updates to the
    // same flag are last-writer-wins.
    async fn update_flag(&self, flag_key: &str, update: &FlagUpdate) -> Result<Flag, StoreError> {
        let mut flag: Flag = self
            .read_json(self.flag_key(flag_key))
            .await?
            .ok_or(StoreError::NotFound)?;
        update.apply(&mut flag);
        self.write_json(self.flag_key(flag_key), &flag).await?;
        Ok(flag)
    }

    async fn set_tenant_override(
        &self,
        tenant_override: &TenantOverride,
    ) -> Result<(), StoreError> {
        self.write_json(
            self.override_key(&tenant_override.tenant_id, &tenant_override.flag_key),
            tenant_override,
        )
        .await
    }

    async fn remove_tenant_override(
        &self,
        tenant_id: &str,
        flag_key: &str,
    ) -> Result<(), StoreError> {
        self.client
            .del(self.override_key(tenant_id, flag_key))
            .await
            .map_err(classify_redis_error)
    }

    async fn set_kill_switch(&self, kill_switch: &KillSwitch) -> Result<(), StoreError> {
        self.write_json(self.kill_switch_key(&kill_switch.scope), kill_switch)
            .await
    }

    async fn list_flags(&self) -> Result<Vec<Flag>, StoreError> {
        let keys = self
            .client
            .smembers(self.flag_index_key())
            .await
            .map_err(classify_redis_error)?;
        let mut flags = self.batch_get_flags(&keys).await?;
        flags.sort_by(|a, b| a.flag_key.cmp(&b.flag_key));
        Ok(flags)
    }

    /// Missing keys are skipped rather than reported.
    async fn batch_get_flags(&self, flag_keys: &[String]) -> Result<Vec<Flag>, StoreError> {
        if flag_keys.is_empty() {
            return Ok(Vec::new());
        }
        let redis_keys = flag_keys.iter().map(|k| self.flag_key(k)).collect();
        let raw_values = self
            .client
            .mget(redis_keys)
            .await
            .map_err(classify_redis_error)?;

        let mut flags = Vec::with_capacity(raw_values.len());
        for raw in raw_values.into_iter().flatten() {
            let flag: Flag = serde_json::from_str(&raw).map_err(|e| {
                tracing::error!("failed to parse stored flag: {}", e);
                StoreError::Validation(e.to_string())
            })?;
            flags.push(flag);
        }
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::MockRedisClient;
    use crate::test_utils::test_flag;

    fn store_for(client: &MockRedisClient, environment: &str) -> RedisFlagStore {
        RedisFlagStore::new(Arc::new(client.clone()), environment)
    }

    #[tokio::test]
    async fn test_flag_round_trips_through_redis() {
        let client = MockRedisClient::new();
        let store = store_for(&client, "production");

        let flag = test_flag("promo_banner", true);
        store.create_flag(&flag).await.unwrap();

        let fetched = store.get_flag("promo_banner").await.unwrap().unwrap();
        assert_eq!(fetched.flag_key, "promo_banner");
        assert!(fetched.default_enabled);
        assert!(client.contains_key("flags:production:flag:promo_banner"));
    }

    #[tokio::test]
    async fn test_duplicate_create_is_a_conditional_check_failure() {
        let client = MockRedisClient::new();
        let store = store_for(&client, "production");

        store
            .create_flag(&test_flag("promo_banner", false))
            .await
            .unwrap();
        match store.create_flag(&test_flag("promo_banner", true)).await {
            Err(StoreError::ConditionalCheckFailed(_)) => (),
            other => panic!("expected ConditionalCheckFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_environments_do_not_share_keys() {
        let client = MockRedisClient::new();
        let production = store_for(&client, "production");
        let staging = store_for(&client, "staging");

        production
            .create_flag(&test_flag("promo_banner", true))
            .await
            .unwrap();

        assert!(production
            .get_flag("promo_banner")
            .await
            .unwrap()
            .is_some());
        assert!(staging.get_flag("promo_banner").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_flag_is_not_found() {
        let client = MockRedisClient::new();
        let store = store_for(&client, "production");

        let update = FlagUpdate {
            default_enabled: Some(true),
            ..Default::default()
        };
        match store.update_flag("missing", &update).await {
            Err(StoreError::NotFound) => (),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_flags_uses_the_index() {
        let client = MockRedisClient::new();
        let store = store_for(&client, "production");

        store.create_flag(&test_flag("b_flag", false)).await.unwrap();
        store.create_flag(&test_flag("a_flag", false)).await.unwrap();

        let flags = store.list_flags().await.unwrap();
        let keys: Vec<&str> = flags.iter().map(|f| f.flag_key.as_str()).collect();
        assert_eq!(keys, vec!["a_flag", "b_flag"]);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_retryable_unavailable() {
        let client = MockRedisClient::new();
        let store = store_for(&client, "production");
        client.fail_with(Some(CustomRedisError::Timeout));

        match store.get_flag("promo_banner").await {
            Err(err) => {
                assert_eq!(err.classification(), "unavailable");
                assert!(err.is_retryable());
            }
            Ok(_) => panic!("expected a store error"),
        }
    }

    #[tokio::test]
    async fn test_override_removal_deletes_the_key() {
        let client = MockRedisClient::new();
        let store = store_for(&client, "production");

        let tenant_override = TenantOverride {
            tenant_id: "acme".to_string(),
            flag_key: "promo_banner".to_string(),
            enabled: true,
            updated_at: chrono::Utc::now(),
            updated_by: "ops".to_string(),
        };
        store.set_tenant_override(&tenant_override).await.unwrap();
        assert!(store
            .get_tenant_override("acme", "promo_banner")
            .await
            .unwrap()
            .is_some());

        store
            .remove_tenant_override("acme", "promo_banner")
            .await
            .unwrap();
        assert!(store
            .get_tenant_override("acme", "promo_banner")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_corrupted_payload_is_a_validation_error() {
        let client = MockRedisClient::new();
        let store = store_for(&client, "production");

        client
            .set("flags:production:flag:promo_banner".to_string(), "not json".to_string())
            .await
            .unwrap();

        match store.get_flag("promo_banner").await {
            Err(StoreError::Validation(_)) => (),
            other => panic!("expected Validation, got {:?}", other),
        }
    }
}
