//! Suspicious transaction patterns detected over a batch, independently of
//! the rule engine.

mod detector;

pub use detector::{detect_patterns, PatternDetector};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Structuring,
    HighRiskCorridor,
    Velocity,
    TimeOfDay,
}

impl PatternCategory {
    /// Detection order; every run reports each category once, in this order.
    pub const ALL: [PatternCategory; 4] = [
        PatternCategory::Structuring,
        PatternCategory::HighRiskCorridor,
        PatternCategory::Velocity,
        PatternCategory::TimeOfDay,
    ];

    /// Stable identifier, safe to persist.
    pub fn id(&self) -> &'static str {
        match self {
            PatternCategory::Structuring => "pattern-structuring",
            PatternCategory::HighRiskCorridor => "pattern-high-risk-corridor",
            PatternCategory::Velocity => "pattern-velocity",
            PatternCategory::TimeOfDay => "pattern-time-of-day",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PatternCategory::Structuring => "Structuring",
            PatternCategory::HighRiskCorridor => "High-Risk Corridor",
            PatternCategory::Velocity => "Transaction Velocity",
            PatternCategory::TimeOfDay => "Unusual Time of Day",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PatternCategory::Structuring => {
                "Amounts just below the reporting threshold, suggesting deliberate splitting"
            }
            PatternCategory::HighRiskCorridor => {
                "Transfers to receivers in high-risk jurisdictions"
            }
            PatternCategory::Velocity => {
                "Senders transacting unusually often within a short window"
            }
            PatternCategory::TimeOfDay => "Transactions made outside business hours",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            PatternCategory::Structuring => Severity::High,
            PatternCategory::HighRiskCorridor | PatternCategory::Velocity => Severity::Medium,
            PatternCategory::TimeOfDay => Severity::Low,
        }
    }
}

/// Summary of one category over one batch. Recomputed on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub pattern_id: String,
    pub name: String,
    pub description: String,
    pub category: PatternCategory,
    pub severity: Severity,
    pub count: usize,
    /// Sum of sender amounts over the matching transactions
    pub total_amount: f64,
    pub detected_at: DateTime<Utc>,
    /// Matching transaction ids, in input order
    pub transaction_ids: Vec<String>,
}
