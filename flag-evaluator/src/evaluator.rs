use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::instrument;

use crate::api::{EvaluationSource, FlagError, FlagEvaluation};
use crate::cache::FlagCache;
use crate::flag_definitions::{EvaluationContext, KillSwitchScope, RolloutConfig};
use crate::rollout::evaluate_rollout;
use crate::store::{FlagStore, StoreError};

/// The single evaluation entry point, bound to one environment for its whole
/// lifetime. Owns its cache; the store is injected so backends can be
/// swapped without touching the precedence logic.
///
/// Precedence, highest first: kill-switch, cache, tenant override, flag
/// default, rollout. Any failure past the environment check resolves to
/// `false`: a false-negative hides a feature from one tenant, while a
/// false-positive could turn it on for every tenant at once.
pub struct FlagEvaluator {
    environment: String,
    store: Arc<dyn FlagStore + Send + Sync>,
    cache: FlagCache,
    deadline: Duration,
}

impl FlagEvaluator {
    pub fn new(
        environment: impl Into<String>,
        store: Arc<dyn FlagStore + Send + Sync>,
        cache: FlagCache,
        deadline: Duration,
    ) -> Self {
        FlagEvaluator {
            environment: environment.into(),
            store,
            cache,
            deadline,
        }
    }

    pub fn from_config(config: &crate::config::Config, store: Arc<dyn FlagStore + Send + Sync>) -> Self {
        Self::new(
            config.environment.clone(),
            store,
            FlagCache::new(Duration::from_secs(config.cache_ttl_secs)),
            Duration::from_millis(config.evaluation_deadline_ms),
        )
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Decides whether `flag_key` is enabled for the context's tenant.
    ///
    /// The only error this returns is [`FlagError::EnvironmentMismatch`],
    /// which signals a deployment bug. Every runtime failure (store errors,
    /// deadline expiry, unknown flags) resolves to `Ok(false)`.
    pub async fn is_enabled(
        &self,
        context: &EvaluationContext,
        flag_key: &str,
        rollout: Option<&RolloutConfig>,
    ) -> Result<bool, FlagError> {
        Ok(self.evaluate(context, flag_key, rollout).await?.enabled)
    }

    /// Like [`FlagEvaluator::is_enabled`], but wraps the decision in the
    /// envelope API callers hand back to clients.
    #[instrument(skip_all)]
    pub async fn evaluate(
        &self,
        context: &EvaluationContext,
        flag_key: &str,
        rollout: Option<&RolloutConfig>,
    ) -> Result<FlagEvaluation, FlagError> {
        if context.environment != self.environment {
            return Err(FlagError::EnvironmentMismatch {
                expected: self.environment.clone(),
                got: context.environment.clone(),
            });
        }

        let decision = tokio::time::timeout(self.deadline, self.decide(context, flag_key, rollout));
        let (enabled, source) = match decision.await {
            Ok(Ok(decided)) => decided,
            Ok(Err(e)) => {
                tracing::error!(
                    operation = "is_enabled",
                    tenant_id = %context.tenant_id,
                    flag_key,
                    environment = %self.environment,
                    classification = e.classification(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "flag evaluation failed, returning fail-closed default"
                );
                (false, EvaluationSource::Database)
            }
            Err(_) => {
                tracing::error!(
                    operation = "is_enabled",
                    tenant_id = %context.tenant_id,
                    flag_key,
                    environment = %self.environment,
                    classification = "timeout",
                    retryable = true,
                    "flag evaluation exceeded its deadline, returning fail-closed default"
                );
                (false, EvaluationSource::Database)
            }
        };

        Ok(FlagEvaluation {
            enabled,
            flag_key: flag_key.to_string(),
            tenant_id: context.tenant_id.clone(),
            evaluated_at: Utc::now(),
            source,
            ttl: self.cache.ttl().as_secs(),
        })
    }

    async fn decide(
        &self,
        context: &EvaluationContext,
        flag_key: &str,
        rollout: Option<&RolloutConfig>,
    ) -> Result<(bool, EvaluationSource), StoreError> {
        // Kill-switches are re-read on every call so an emergency disable
        // takes effect immediately instead of waiting out a cache TTL. The
        // two fetches have no data dependency, so they run concurrently.
        let scoped = KillSwitchScope::Flag(flag_key.to_string());
        let (global_switch, flag_switch) = tokio::try_join!(
            self.store.get_kill_switch(&KillSwitchScope::Global),
            self.store.get_kill_switch(&scoped),
        )?;
        if let Some(kill_switch) = global_switch.filter(|k| k.enabled) {
            tracing::warn!(flag_key, reason = %kill_switch.reason, "global kill-switch engaged");
            return Ok((false, EvaluationSource::Database));
        }
        if let Some(kill_switch) = flag_switch.filter(|k| k.enabled) {
            tracing::warn!(flag_key, reason = %kill_switch.reason, "flag kill-switch engaged");
            return Ok((false, EvaluationSource::Database));
        }

        // A rollout decision is context-sensitive per call, so it can never
        // be served from a cache keyed only by tenant and flag.
        if rollout.is_none() {
            if let Some(cached) = self.cache.get(&context.tenant_id, flag_key) {
                return Ok((cached, EvaluationSource::Cache));
            }
        }

        if let Some(tenant_override) = self
            .store
            .get_tenant_override(&context.tenant_id, flag_key)
            .await?
        {
            return Ok(match rollout {
                None => {
                    self.cache
                        .set(&context.tenant_id, flag_key, tenant_override.enabled);
                    (tenant_override.enabled, EvaluationSource::Database)
                }
                // An override of false vetoes the rollout outright; an
                // override of true is a gate, not a grant.
                Some(config) => {
                    let enabled = tenant_override.enabled
                        && evaluate_rollout(context, flag_key, config);
                    (enabled, EvaluationSource::Database)
                }
            });
        }

        match self.store.get_flag(flag_key).await? {
            None => {
                // Unknown flags resolve closed but are never cached: a flag
                // created moments later must become visible immediately.
                tracing::warn!(
                    tenant_id = %context.tenant_id,
                    flag_key,
                    "unknown flag requested, returning fail-closed default"
                );
                Ok((false, EvaluationSource::Database))
            }
            Some(flag) => Ok(match rollout {
                None => {
                    self.cache
                        .set(&context.tenant_id, flag_key, flag.default_enabled);
                    (flag.default_enabled, EvaluationSource::Database)
                }
                // Rollout can only promote an otherwise-enabled path, never
                // invent enablement from a disabled default.
                Some(config) => {
                    let enabled =
                        flag.default_enabled && evaluate_rollout(context, flag_key, config);
                    (enabled, EvaluationSource::Database)
                }
            }),
        }
    }

    pub fn invalidate_cache(&self, tenant_id: &str, flag_key: &str) {
        self.cache.invalidate(tenant_id, flag_key);
    }

    pub fn invalidate_all_cache(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FlagError;
    use crate::store::MemoryFlagStore;
    use crate::test_utils::{evaluator_for, seeded_store, test_context, test_flag};

    #[tokio::test]
    async fn test_environment_mismatch_is_surfaced_without_store_reads() {
        let store = Arc::new(MemoryFlagStore::new());
        let evaluator = evaluator_for(store.clone(), "production");

        let context = test_context("acme", "staging");
        match evaluator.is_enabled(&context, "promo_banner", None).await {
            Err(FlagError::EnvironmentMismatch { expected, got }) => {
                assert_eq!(expected, "production");
                assert_eq!(got, "staging");
            }
            other => panic!("expected EnvironmentMismatch, got {:?}", other),
        }
        assert_eq!(store.read_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_the_store() {
        let store = seeded_store("promo_banner", true).await.unwrap();
        let evaluator = evaluator_for(store.clone(), "production");
        let context = test_context("acme", "production");

        assert!(evaluator
            .is_enabled(&context, "promo_banner", None)
            .await
            .unwrap());
        let reads_after_first = store.read_count();

        let evaluation = evaluator
            .evaluate(&context, "promo_banner", None)
            .await
            .unwrap();
        assert!(evaluation.enabled);
        assert_eq!(evaluation.source, EvaluationSource::Cache);
        // Only the two uncacheable kill-switch reads hit the store again.
        assert_eq!(store.read_count(), reads_after_first + 2);
    }

    #[tokio::test]
    async fn test_rollout_calls_bypass_the_cache() {
        let store = seeded_store("new_checkout", true).await.unwrap();
        let evaluator = evaluator_for(store.clone(), "production");

        // Warm the cache with a plain evaluation.
        let mut context = test_context("acme", "production");
        assert!(evaluator
            .is_enabled(&context, "new_checkout", None)
            .await
            .unwrap());

        // bob buckets to 84 for this flag, beyond a 50% rollout; the cached
        // `true` must not leak into the rollout decision.
        context.user_id = Some("bob".to_string());
        let config = RolloutConfig::percentage(50);
        assert!(!evaluator
            .is_enabled(&context, "new_checkout", Some(&config))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unknown_flag_is_fail_closed_and_uncached() {
        let store = Arc::new(MemoryFlagStore::new());
        let evaluator = evaluator_for(store.clone(), "production");
        let context = test_context("acme", "production");

        assert!(!evaluator
            .is_enabled(&context, "not_yet_created", None)
            .await
            .unwrap());

        // The flag appears; the next call must see it immediately.
        store
            .create_flag(&test_flag("not_yet_created", true))
            .await
            .unwrap();
        assert!(evaluator
            .is_enabled(&context, "not_yet_created", None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_store_failure_is_absorbed_and_never_cached() {
        let store = seeded_store("promo_banner", true).await.unwrap();
        let evaluator = evaluator_for(store.clone(), "production");
        let context = test_context("acme", "production");

        store.fail_with(Some(StoreError::Throttled("hot partition".to_string())));
        assert!(!evaluator
            .is_enabled(&context, "promo_banner", None)
            .await
            .unwrap());

        // Once the store heals the true value comes back; a cached failure
        // would have pinned `false` for the TTL.
        store.fail_with(None);
        assert!(evaluator
            .is_enabled(&context, "promo_banner", None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_default_false_short_circuits_rollout() {
        let store = seeded_store("new_checkout", false).await.unwrap();
        let evaluator = evaluator_for(store, "production");

        let mut context = test_context("acme", "production");
        // dave buckets to 17, well inside a 100% rollout.
        context.user_id = Some("dave".to_string());
        let config = RolloutConfig::percentage(100);

        assert!(!evaluator
            .is_enabled(&context, "new_checkout", Some(&config))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_default_true_defers_to_rollout() {
        let store = seeded_store("new_checkout", true).await.unwrap();
        let evaluator = evaluator_for(store, "production");

        let mut context = test_context("acme", "production");
        let config = RolloutConfig::percentage(50);

        // alice buckets to 41 (in), bob to 84 (out).
        context.user_id = Some("alice".to_string());
        assert!(evaluator
            .is_enabled(&context, "new_checkout", Some(&config))
            .await
            .unwrap());
        context.user_id = Some("bob".to_string());
        assert!(!evaluator
            .is_enabled(&context, "new_checkout", Some(&config))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_cache_forces_a_fresh_read() {
        let store = seeded_store("promo_banner", true).await.unwrap();
        let evaluator = evaluator_for(store.clone(), "production");
        let context = test_context("acme", "production");

        assert!(evaluator
            .is_enabled(&context, "promo_banner", None)
            .await
            .unwrap());

        let update = crate::flag_definitions::FlagUpdate {
            default_enabled: Some(false),
            ..Default::default()
        };
        store.update_flag("promo_banner", &update).await.unwrap();

        // Still served from cache.
        assert!(evaluator
            .is_enabled(&context, "promo_banner", None)
            .await
            .unwrap());

        evaluator.invalidate_cache("acme", "promo_banner");
        assert!(!evaluator
            .is_enabled(&context, "promo_banner", None)
            .await
            .unwrap());
    }
}
