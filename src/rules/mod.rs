//! Risk rules and the read-only rule source boundary.

use crate::condition::Condition;
use crate::error::{ConditionError, RiskError, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A named, scored, categorized risk criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Stable identifier, independent of any storage key.
    pub rule_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Open-ended, e.g. `transaction`, `behavioral`, `kyc`.
    pub category: String,
    pub risk_score: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Condition in the JSON grammar of [`crate::condition`]. Kept verbatim.
    pub condition: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl Rule {
    pub fn compile(&self) -> Result<Condition, ConditionError> {
        Condition::parse(&self.condition)
    }

    /// SHA-256 of the serialized condition; identifies the rule revision
    /// that produced a match.
    pub fn condition_fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(&self.condition).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }

    /// Checks done before a rule is written to a store.
    pub fn validate(&self) -> Result<(), RiskError> {
        if self.rule_id.trim().is_empty() {
            return Err(RiskError::invalid("rule_id", "must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(RiskError::invalid("name", "must not be empty"));
        }
        if self.risk_score == 0 {
            return Err(RiskError::invalid("risk_score", "must be positive"));
        }
        self.compile()
            .map(|_| ())
            .map_err(|e| RiskError::invalid("condition", e.to_string()))
    }
}

/// Category selector; `"all"` (or empty) selects every category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryFilter {
    All,
    Only(String),
}

impl CategoryFilter {
    pub fn as_option(&self) -> Option<&str> {
        match self {
            CategoryFilter::All => None,
            CategoryFilter::Only(c) => Some(c),
        }
    }
}

impl From<&str> for CategoryFilter {
    fn from(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            CategoryFilter::All
        } else {
            CategoryFilter::Only(s.to_string())
        }
    }
}

impl From<Option<&str>> for CategoryFilter {
    fn from(s: Option<&str>) -> Self {
        s.map(CategoryFilter::from).unwrap_or(CategoryFilter::All)
    }
}

/// Read-only source of rules.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Active rules only, optionally restricted to one category, ordered by `rule_id`.
    async fn list_active_rules(&self, category: Option<&str>) -> Result<Vec<Rule>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(condition: Value) -> Rule {
        Rule {
            rule_id: "R-1".into(),
            name: "Large transfer".into(),
            description: String::new(),
            category: "transaction".into(),
            risk_score: 40,
            is_active: true,
            condition,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn category_filter_from_str() {
        assert_eq!(CategoryFilter::from("all"), CategoryFilter::All);
        assert_eq!(CategoryFilter::from("ALL"), CategoryFilter::All);
        assert_eq!(CategoryFilter::from(""), CategoryFilter::All);
        assert_eq!(CategoryFilter::from("kyc"), CategoryFilter::Only("kyc".into()));
        assert_eq!(CategoryFilter::from(None), CategoryFilter::All);
    }

    #[test]
    fn validate_rejects_bad_condition_and_zero_score() {
        assert!(rule(json!({ ">": [{ "var": "amount" }, 1] })).validate().is_ok());
        assert!(rule(json!({ "~": [1, 2] })).validate().is_err());
        let mut r = rule(json!(true));
        r.risk_score = 0;
        assert!(r.validate().is_err());
    }

    #[test]
    fn validate_checks_conditions_kept_as_text() {
        assert!(rule(json!(r#"{">":[{"var":"amount"},9000]}"#)).validate().is_ok());
        let err = rule(json!("amount > 9000")).validate().unwrap_err();
        assert!(matches!(err, RiskError::InvalidInput { ref field, .. } if field == "condition"));
    }

    #[test]
    fn fingerprint_tracks_condition_edits() {
        let a = rule(json!({ ">": [{ "var": "amount" }, 9000] }));
        let mut b = a.clone();
        assert_eq!(a.condition_fingerprint(), b.condition_fingerprint());
        b.condition = json!({ ">": [{ "var": "amount" }, 8000] });
        assert_ne!(a.condition_fingerprint(), b.condition_fingerprint());
        assert_eq!(a.condition_fingerprint().len(), 64);
    }

    #[test]
    fn rule_json_defaults_to_active() {
        let r: Rule = serde_json::from_value(json!({
            "rule_id": "R-9", "name": "n", "category": "kyc", "risk_score": 10,
            "condition": { "var": "isPep" }
        }))
        .unwrap();
        assert!(r.is_active);
    }
}
