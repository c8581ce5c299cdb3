//! Rule-based risk scoring: evaluation, aggregation, levels, and the audit trail.

mod engine;
mod model;

pub use engine::{RiskEngine, RiskLevel};
pub use model::{
    AssessmentRun, MatchStore, MatchedRule, RiskAssessmentResult, RiskFactor, RiskMatch,
    StoredMatch,
};
