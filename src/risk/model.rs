//! Assessment results and the audit records behind them.

use super::RiskLevel;
use crate::entity::EntityType;
use crate::error::StoreError;
use crate::rules::Rule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One rule matching one entity during one assessment run. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMatch {
    pub id: Uuid,
    pub rule_id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub run_id: Uuid,
    pub matched_at: DateTime<Utc>,
    /// Fingerprint of the rule condition that matched.
    pub condition_hash: String,
    /// Evidence; passed through, never interpreted by the engine.
    pub match_data: Value,
}

/// A stored match joined with the rule it refers to (`None` if the rule is gone).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMatch {
    pub risk_match: RiskMatch,
    pub rule: Option<Rule>,
}

/// Summary row written after the matches of an assessment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRun {
    pub run_id: Uuid,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub score: u8,
    pub raw_score: u32,
    pub level: RiskLevel,
    pub rules_evaluated: usize,
    pub rules_skipped: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRule {
    pub rule_id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub risk_score: u32,
}

impl From<&Rule> for MatchedRule {
    fn from(rule: &Rule) -> Self {
        Self {
            rule_id: rule.rule_id.clone(),
            name: rule.name.clone(),
            description: rule.description.clone(),
            category: rule.category.clone(),
            risk_score: rule.risk_score,
        }
    }
}

/// Contribution of one matched rule to the raw score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub name: String,
    pub value: f64,
    /// Share of the raw score, 0.0..=1.0
    pub weight: f64,
}

/// Outcome of one assessment of one entity. Derived data: it can always be
/// rebuilt from stored matches plus rule lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessmentResult {
    pub entity_id: String,
    pub entity_type: EntityType,
    /// `None` when rebuilt from matches recorded without a run summary.
    pub run_id: Option<Uuid>,
    /// Sum of matched rule scores clamped to 0..=100.
    pub score: u8,
    pub raw_score: u32,
    pub level: RiskLevel,
    pub matched_rules: Vec<MatchedRule>,
    /// Distinct categories of the matched rules, sorted.
    pub categories: Vec<String>,
    pub factors: Vec<RiskFactor>,
    /// Rules skipped because their condition was malformed.
    pub skipped_rules: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub assessed_at: DateTime<Utc>,
}

impl RiskAssessmentResult {
    pub fn matched_rule_ids(&self) -> Vec<&str> {
        self.matched_rules.iter().map(|r| r.rule_id.as_str()).collect()
    }
}

/// Append-only sink for matches and run summaries, readable per entity.
#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn record_match(&self, risk_match: &RiskMatch) -> Result<(), StoreError>;

    async fn record_run(&self, run: &AssessmentRun) -> Result<(), StoreError>;

    /// All matches for the entity, oldest first, joined with rule metadata.
    async fn list_matches(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Vec<StoredMatch>, StoreError>;

    async fn latest_run(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<AssessmentRun>, StoreError>;
}
