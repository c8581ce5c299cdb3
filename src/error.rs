//! Error taxonomy for condition parsing, store I/O, and risk assessment.

use crate::entity::EntityType;
use crate::risk::RiskAssessmentResult;
use thiserror::Error;

/// A rule condition that cannot be interpreted. The rule is skipped for the
/// entity being assessed; assessment of the remaining rules continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("malformed condition: {0}")]
    Parse(String),

    #[error("unknown operator `{0}`")]
    UnknownOperator(String),

    #[error("operator `{op}` expects {expected} operand(s), got {got}")]
    Arity {
        op: String,
        expected: &'static str,
        got: usize,
    },

    #[error("invalid variable reference: {0}")]
    InvalidVar(String),

    #[error("condition nested deeper than {max} levels")]
    TooDeep { max: usize },
}

/// Failure at an external I/O boundary (rule source, entity source, match sink).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("{entity_type} `{id}` not found")]
    NotFound { entity_type: EntityType, id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("backend not configured: {0}")]
    NotConfigured(String),
}

#[derive(Debug, Error)]
pub enum RiskError {
    /// Rules or entity could not be read. The entity is "not assessed";
    /// no partial score is valid.
    #[error("repository error: {0}")]
    Repository(#[from] StoreError),

    /// The score was computed but one or more audit writes failed. The
    /// computed result is carried along so callers can still display it.
    #[error("audit trail incomplete for `{}`: {failed_writes} write(s) failed: {source}", .result.entity_id)]
    AuditTrail {
        result: Box<RiskAssessmentResult>,
        failed_writes: usize,
        #[source]
        source: StoreError,
    },

    #[error("invalid input: {field}: {reason}")]
    InvalidInput { field: String, reason: String },
}

impl RiskError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        RiskError::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The computed result, if the failure happened after scoring.
    pub fn partial_result(&self) -> Option<&RiskAssessmentResult> {
        match self {
            RiskError::AuditTrail { result, .. } => Some(result),
            _ => None,
        }
    }
}
