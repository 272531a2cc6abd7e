use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};

use crate::cache::FlagCache;
use crate::evaluator::FlagEvaluator;
use crate::flag_definitions::{EvaluationContext, Flag};
use crate::store::{FlagStore, MemoryFlagStore};

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

pub fn test_flag(flag_key: &str, default_enabled: bool) -> Flag {
    Flag {
        flag_key: flag_key.to_string(),
        description: format!("test flag {}", flag_key),
        default_enabled,
        owner: "platform-team".to_string(),
        created_at: Utc::now(),
        expires_at: None,
    }
}

pub fn test_context(tenant_id: &str, environment: &str) -> EvaluationContext {
    EvaluationContext::new(tenant_id, environment)
}

/// Store pre-seeded with one flag.
pub async fn seeded_store(
    flag_key: &str,
    default_enabled: bool,
) -> Result<Arc<MemoryFlagStore>, Error> {
    let store = Arc::new(MemoryFlagStore::new());
    store
        .create_flag(&test_flag(flag_key, default_enabled))
        .await?;
    Ok(store)
}

/// Evaluator with a generous TTL and deadline so tests only exercise what
/// they mean to.
pub fn evaluator_for(store: Arc<MemoryFlagStore>, environment: &str) -> FlagEvaluator {
    FlagEvaluator::new(
        environment,
        store,
        FlagCache::new(Duration::from_secs(60)),
        Duration::from_secs(1),
    )
}
