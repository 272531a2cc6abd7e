use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum FlagError {
    /// The caller handed an evaluator a context for a different environment.
    /// This is a wiring bug, so unlike every other failure it is surfaced
    /// instead of being folded into the fail-closed default.
    #[error("evaluator is bound to environment '{expected}' but the context says '{got}'")]
    EnvironmentMismatch { expected: String, got: String },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("flag deletion is not allowed")]
    DeletionNotAllowed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where an evaluation result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationSource {
    Cache,
    Database,
}

/// The envelope handed to callers that wrap the evaluator in an API layer.
#[derive(Debug, Clone, Serialize)]
pub struct FlagEvaluation {
    pub enabled: bool,
    pub flag_key: String,
    pub tenant_id: String,
    pub evaluated_at: DateTime<Utc>,
    pub source: EvaluationSource,
    /// Cache TTL in seconds; the longest a caller might observe a stale value.
    pub ttl: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_source_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&EvaluationSource::Cache).unwrap(),
            "\"cache\""
        );
        assert_eq!(
            serde_json::to_string(&EvaluationSource::Database).unwrap(),
            "\"database\""
        );
    }

    #[test]
    fn test_environment_mismatch_message_names_both_sides() {
        let err = FlagError::EnvironmentMismatch {
            expected: "production".to_string(),
            got: "staging".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("production"));
        assert!(message.contains("staging"));
    }
}
