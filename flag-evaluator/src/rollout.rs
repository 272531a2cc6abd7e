use chrono::{Datelike, Timelike, Weekday};

use crate::flag_definitions::{EvaluationContext, RolloutConfig};

const FNV_OFFSET_BASIS: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// Decides whether a context qualifies for a staged rollout. Pure function:
/// no I/O, no mutable state, deterministic for a given input.
///
/// Five gates apply in order, each a hard AND: time window, business hours,
/// region targeting, cohort targeting, percentage bucketing. Missing context
/// fields make the corresponding gate pass trivially, except bucketing,
/// which falls back to an empty-string user id for anonymous contexts.
pub fn evaluate_rollout(
    context: &EvaluationContext,
    flag_key: &str,
    config: &RolloutConfig,
) -> bool {
    within_time_window(context, config)
        && within_business_hours(context, config)
        && region_targeted(context, config)
        && cohort_targeted(context, config)
        && within_percentage(context, flag_key, config)
}

fn within_time_window(context: &EvaluationContext, config: &RolloutConfig) -> bool {
    let Some(timestamp) = context.timestamp else {
        return true;
    };
    if let Some(start) = config.start_date {
        if timestamp < start {
            return false;
        }
    }
    if let Some(end) = config.end_date {
        if timestamp > end {
            return false;
        }
    }
    true
}

// Weekdays 09:00-17:59 on the supplied wall-clock timestamp; callers own
// timezone conversion.
fn within_business_hours(context: &EvaluationContext, config: &RolloutConfig) -> bool {
    if !config.business_hours_only {
        return true;
    }
    let Some(timestamp) = context.timestamp else {
        return true;
    };
    if matches!(timestamp.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    (9..18).contains(&timestamp.hour())
}

fn region_targeted(context: &EvaluationContext, config: &RolloutConfig) -> bool {
    if config.target_regions.is_empty() {
        return true;
    }
    match &context.region {
        Some(region) => config.target_regions.contains(region),
        None => true,
    }
}

fn cohort_targeted(context: &EvaluationContext, config: &RolloutConfig) -> bool {
    if config.user_cohorts.is_empty() {
        return true;
    }
    match &context.user_cohort {
        Some(cohort) => config.user_cohorts.contains(cohort),
        None => true,
    }
}

fn within_percentage(context: &EvaluationContext, flag_key: &str, config: &RolloutConfig) -> bool {
    let user_id = context.user_id.as_deref().unwrap_or("");
    percentage_bucket(user_id, flag_key) < u32::from(config.percentage)
}

/// Buckets a user into [0, 100) for percentage rollouts. Given the same
/// user id and flag key this always returns the same bucket, so rollout
/// membership is stable for a user while the percentage ramps up.
pub fn percentage_bucket(user_id: &str, flag_key: &str) -> u32 {
    fnv1a32(&format!("{user_id}-{flag_key}")) % 100
}

/// FNV-1a, 32-bit, over the UTF-8 bytes of the input. Must stay bit-for-bit
/// reproducible across implementations: a user's bucket may not move when a
/// different service computes it.
pub fn fnv1a32(input: &str) -> u32 {
    input.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}
