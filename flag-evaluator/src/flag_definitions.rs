use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An environment-scoped toggle with a default enablement state.
///
/// Flags are append/mutate-only: once created they can be edited but never
/// deleted, so a stale key always resolves to its stored default rather than
/// disappearing under a caller.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Flag {
    pub flag_key: String,
    pub description: String,
    #[serde(default)]
    pub default_enabled: bool,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Partial update for a [`Flag`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FlagUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl FlagUpdate {
    pub fn apply(&self, flag: &mut Flag) {
        if let Some(description) = &self.description {
            flag.description = description.clone();
        }
        if let Some(default_enabled) = self.default_enabled {
            flag.default_enabled = default_enabled;
        }
        if let Some(owner) = &self.owner {
            flag.owner = owner.clone();
        }
        if let Some(expires_at) = self.expires_at {
            flag.expires_at = Some(expires_at);
        }
    }
}

/// Per-tenant, per-flag boolean that supersedes the flag default.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenantOverride {
    pub tenant_id: String,
    pub flag_key: String,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

/// Scope of a kill-switch: every flag in the environment, or one flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KillSwitchScope {
    Global,
    Flag(String),
}

/// Emergency, highest-precedence override. When enabled it forces its scope
/// disabled regardless of overrides, defaults, or rollout state.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KillSwitch {
    pub scope: KillSwitchScope,
    pub enabled: bool,
    pub reason: String,
    pub activated_at: DateTime<Utc>,
    pub activated_by: String,
}

/// Per-call staged-rollout policy. Ephemeral: supplied by the caller on each
/// evaluation and never persisted, so two calls for the same tenant and flag
/// may carry different configs.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RolloutConfig {
    /// Percentage of users admitted by the bucketing gate, 0-100.
    pub percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Empty means no region targeting.
    #[serde(default)]
    pub target_regions: HashSet<String>,
    /// Empty means no cohort targeting.
    #[serde(default)]
    pub user_cohorts: HashSet<String>,
    #[serde(default)]
    pub business_hours_only: bool,
}

impl RolloutConfig {
    pub fn percentage(percentage: u8) -> Self {
        RolloutConfig {
            percentage,
            ..Default::default()
        }
    }
}

/// Per-call input describing the tenant, user, and environment a decision is
/// made for. `tenant_id` and `environment` are mandatory; everything else is
/// optional and the rollout gates treat missing fields as not applicable.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluationContext {
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_cohort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EvaluationContext {
    pub fn new(tenant_id: impl Into<String>, environment: impl Into<String>) -> Self {
        EvaluationContext {
            tenant_id: tenant_id.into(),
            user_id: None,
            environment: environment.into(),
            region: None,
            user_cohort: None,
            timestamp: None,
        }
    }
}
