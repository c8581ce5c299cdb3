//! Evaluates active rules against an entity, aggregates matched scores into a
//! clamped composite, derives a level, and records the audit trail.

use super::model::{
    AssessmentRun, MatchStore, MatchedRule, RiskAssessmentResult, RiskFactor, RiskMatch,
    StoredMatch,
};
use crate::condition::resolve_path;
use crate::config::RiskConfig;
use crate::entity::{EntityRecord, EntitySource, EntityType};
use crate::error::{RiskError, StoreError};
use crate::rules::{CategoryFilter, Rule, RuleSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Composite scores are capped here.
pub const MAX_SCORE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// `high_severity_matches` counts matched rules scoring at least
    /// `config.high_severity_rule_score`; critical needs enough of them.
    pub fn from_score(score: u8, high_severity_matches: usize, config: &RiskConfig) -> Self {
        if score >= config.critical_threshold
            && high_severity_matches >= config.critical_min_high_severity
        {
            RiskLevel::Critical
        } else if score >= config.high_threshold {
            RiskLevel::High
        } else if score >= config.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns (raw sum, clamped score).
fn aggregate(matched: &[MatchedRule]) -> (u32, u8) {
    let raw = matched
        .iter()
        .fold(0u32, |acc, r| acc.saturating_add(r.risk_score));
    (raw, raw.min(u32::from(MAX_SCORE)) as u8)
}

fn factors(matched: &[MatchedRule], raw: u32) -> Vec<RiskFactor> {
    matched
        .iter()
        .map(|r| RiskFactor {
            name: r.name.clone(),
            value: f64::from(r.risk_score),
            weight: if raw == 0 {
                0.0
            } else {
                f64::from(r.risk_score) / f64::from(raw)
            },
        })
        .collect()
}

/// Values of every field the condition references; absent fields become null.
fn evidence(fields: &Map<String, Value>, paths: &[&str]) -> Value {
    let mut out = Map::new();
    for path in paths {
        let v = resolve_path(fields, path).cloned().unwrap_or(Value::Null);
        out.insert((*path).to_string(), v);
    }
    Value::Object(out)
}

pub struct RiskEngine {
    rules: Arc<dyn RuleSource>,
    matches: Arc<dyn MatchStore>,
    entities: Option<Arc<dyn EntitySource>>,
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(
        config: RiskConfig,
        rules: Arc<dyn RuleSource>,
        matches: Arc<dyn MatchStore>,
    ) -> Self {
        Self {
            rules,
            matches,
            entities: None,
            config,
        }
    }

    /// Enables [`RiskEngine::assess_entity`].
    pub fn with_entity_source(mut self, entities: Arc<dyn EntitySource>) -> Self {
        self.entities = Some(entities);
        self
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub async fn get_rules_by_category(
        &self,
        category: impl Into<CategoryFilter>,
    ) -> Result<Vec<Rule>, RiskError> {
        let filter = category.into();
        let mut rules = self.rules.list_active_rules(filter.as_option()).await?;
        rules.retain(|r| r.is_active);
        Ok(rules)
    }

    /// Fetch the entity from the configured entity source, then evaluate it.
    pub async fn assess_entity(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<RiskAssessmentResult, RiskError> {
        let source = self.entities.as_ref().ok_or_else(|| {
            RiskError::Repository(StoreError::NotConfigured("entity source".into()))
        })?;
        let entity = source.fetch_entity(entity_id, entity_type).await?;
        self.evaluate_entity_risk(&entity).await
    }

    /// Evaluate every active rule against the entity and record one match per
    /// rule that holds. Malformed conditions are skipped and logged.
    ///
    /// Each call is a new run with its own `run_id`; matches are appended,
    /// never overwritten. The run summary is written after the matches and
    /// only if all of them were recorded. If any audit write fails the
    /// computed result is returned inside [`RiskError::AuditTrail`].
    pub async fn evaluate_entity_risk(
        &self,
        entity: &EntityRecord,
    ) -> Result<RiskAssessmentResult, RiskError> {
        if entity.id.trim().is_empty() {
            return Err(RiskError::invalid("id", "entity id must not be empty"));
        }
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let rules = self.get_rules_by_category(CategoryFilter::All).await?;

        let mut matched: Vec<&Rule> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut records: Vec<RiskMatch> = Vec::new();

        for rule in &rules {
            let condition = match rule.compile() {
                Ok(c) => c,
                Err(e) => {
                    warn!(
                        rule_id = %rule.rule_id,
                        entity_id = %entity.id,
                        error = %e,
                        "skipping rule with malformed condition"
                    );
                    skipped.push(rule.rule_id.clone());
                    continue;
                }
            };
            if !condition.evaluate(&entity.fields) {
                continue;
            }
            debug!(rule_id = %rule.rule_id, entity_id = %entity.id, "rule matched");
            records.push(RiskMatch {
                id: Uuid::new_v4(),
                rule_id: rule.rule_id.clone(),
                entity_id: entity.id.clone(),
                entity_type: entity.entity_type,
                run_id,
                matched_at: Utc::now(),
                condition_hash: rule.condition_fingerprint(),
                match_data: json!({
                    "rule_name": rule.name,
                    "category": rule.category,
                    "risk_score": rule.risk_score,
                    "condition": rule.condition,
                    "evidence": evidence(&entity.fields, &condition.referenced_paths()),
                }),
            });
            matched.push(rule);
        }

        let matched: Vec<MatchedRule> = matched.into_iter().map(MatchedRule::from).collect();
        let result = self.summarize(
            &entity.id,
            entity.entity_type,
            Some(run_id),
            matched,
            skipped,
            started_at,
            Utc::now(),
        );

        let run = AssessmentRun {
            run_id,
            entity_id: entity.id.clone(),
            entity_type: entity.entity_type,
            score: result.score,
            raw_score: result.raw_score,
            level: result.level,
            rules_evaluated: rules.len(),
            rules_skipped: result.skipped_rules.clone(),
            started_at,
            completed_at: result.assessed_at,
        };

        let mut failed_writes = 0usize;
        let mut first_error: Option<StoreError> = None;
        for record in &records {
            if let Err(e) = self.matches.record_match(record).await {
                error!(rule_id = %record.rule_id, entity_id = %entity.id, error = %e, "failed to record risk match");
                failed_writes += 1;
                first_error.get_or_insert(e);
            }
        }
        // No run summary unless every match landed; reloads keep the previous run.
        if first_error.is_some() {
            warn!(
                entity_id = %entity.id,
                run_id = %run_id,
                failed_writes,
                "assessment run not recorded: match writes failed"
            );
        } else if let Err(e) = self.matches.record_run(&run).await {
            error!(entity_id = %entity.id, run_id = %run_id, error = %e, "failed to record assessment run");
            failed_writes += 1;
            first_error.get_or_insert(e);
        }

        self.log_result(&result);

        match first_error {
            Some(source) => Err(RiskError::AuditTrail {
                result: Box::new(result),
                failed_writes,
                source,
            }),
            None => Ok(result),
        }
    }

    /// Rebuild the latest assessment from stored matches without re-evaluating.
    ///
    /// Uses the matches of the most recent run; when no run summary exists,
    /// the latest match per rule. Scores come from the joined rules' current
    /// `risk_score`, or the snapshot in the match evidence if the rule is gone.
    pub async fn load_existing_matches(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<RiskAssessmentResult, RiskError> {
        if entity_id.trim().is_empty() {
            return Err(RiskError::invalid("id", "entity id must not be empty"));
        }
        let stored = self.matches.list_matches(entity_id, entity_type).await?;
        let latest = self.matches.latest_run(entity_id, entity_type).await?;

        let current: Vec<&StoredMatch> = match &latest {
            Some(run) => stored
                .iter()
                .filter(|s| s.risk_match.run_id == run.run_id)
                .collect(),
            None => latest_per_rule(&stored),
        };

        let matched: Vec<MatchedRule> = current.iter().filter_map(|s| rebuild(s)).collect();

        let now = Utc::now();
        let (run_id, skipped, started_at, assessed_at) = match latest {
            Some(run) => (
                Some(run.run_id),
                run.rules_skipped,
                run.started_at,
                run.completed_at,
            ),
            None => (
                None,
                Vec::new(),
                current
                    .iter()
                    .map(|s| s.risk_match.matched_at)
                    .min()
                    .unwrap_or(now),
                current
                    .iter()
                    .map(|s| s.risk_match.matched_at)
                    .max()
                    .unwrap_or(now),
            ),
        };

        Ok(self.summarize(
            entity_id,
            entity_type,
            run_id,
            matched,
            skipped,
            started_at,
            assessed_at,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn summarize(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        run_id: Option<Uuid>,
        matched: Vec<MatchedRule>,
        skipped_rules: Vec<String>,
        started_at: DateTime<Utc>,
        assessed_at: DateTime<Utc>,
    ) -> RiskAssessmentResult {
        let (raw_score, score) = aggregate(&matched);
        let high_severity = matched
            .iter()
            .filter(|r| r.risk_score >= self.config.high_severity_rule_score)
            .count();
        let categories: BTreeSet<String> = matched.iter().map(|r| r.category.clone()).collect();
        RiskAssessmentResult {
            entity_id: entity_id.to_string(),
            entity_type,
            run_id,
            score,
            raw_score,
            level: RiskLevel::from_score(score, high_severity, &self.config),
            factors: factors(&matched, raw_score),
            categories: categories.into_iter().collect(),
            matched_rules: matched,
            skipped_rules,
            started_at,
            assessed_at,
        }
    }

    fn log_result(&self, result: &RiskAssessmentResult) {
        if result.level == RiskLevel::Low {
            debug!(
                entity_id = %result.entity_id,
                entity_type = %result.entity_type,
                score = result.score,
                "risk assessed"
            );
        } else {
            info!(
                entity_id = %result.entity_id,
                entity_type = %result.entity_type,
                score = result.score,
                level = %result.level,
                matched = result.matched_rules.len(),
                "risk assessed"
            );
        }
    }
}

fn latest_per_rule(stored: &[StoredMatch]) -> Vec<&StoredMatch> {
    let mut latest: HashMap<&str, &StoredMatch> = HashMap::new();
    for s in stored {
        let entry = latest.entry(s.risk_match.rule_id.as_str()).or_insert(s);
        if s.risk_match.matched_at >= entry.risk_match.matched_at {
            *entry = s;
        }
    }
    let mut out: Vec<&StoredMatch> = latest.into_values().collect();
    out.sort_by(|a, b| a.risk_match.rule_id.cmp(&b.risk_match.rule_id));
    out
}

fn rebuild(stored: &StoredMatch) -> Option<MatchedRule> {
    if let Some(rule) = &stored.rule {
        return Some(MatchedRule::from(rule));
    }
    let data = &stored.risk_match.match_data;
    let Some(score) = data
        .get("risk_score")
        .and_then(Value::as_u64)
        .and_then(|s| u32::try_from(s).ok())
    else {
        warn!(
            rule_id = %stored.risk_match.rule_id,
            "match references unknown rule without a score snapshot; ignored"
        );
        return None;
    };
    let text = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Some(MatchedRule {
        rule_id: stored.risk_match.rule_id.clone(),
        name: text("rule_name"),
        description: String::new(),
        category: text("category"),
        risk_score: score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use serde_json::json;

    fn rule(id: &str, category: &str, score: u32, condition: Value) -> Rule {
        Rule {
            rule_id: id.into(),
            name: format!("rule {}", id),
            description: String::new(),
            category: category.into(),
            risk_score: score,
            is_active: true,
            condition,
            created_at: None,
            updated_at: None,
        }
    }

    fn scenario_rules() -> Vec<Rule> {
        vec![
            rule("A", "transaction", 40, json!({ ">": [{ "var": "amount" }, 9000] })),
            rule(
                "B",
                "high_risk_corridor",
                50,
                json!({ "in": [{ "var": "receiverCountryCode" }, ["AF", "IR"]] }),
            ),
        ]
    }

    fn engine_with(rules: Vec<Rule>) -> (RiskEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_rules(rules));
        let engine = RiskEngine::new(RiskConfig::default(), store.clone(), store.clone());
        (engine, store)
    }

    fn tx(id: &str, fields: Value) -> EntityRecord {
        EntityRecord::from_json(EntityType::Transaction, {
            let mut v = fields;
            v["id"] = json!(id);
            v
        })
        .unwrap()
    }

    #[test]
    fn level_bands_are_contiguous() {
        let c = RiskConfig::default();
        assert_eq!(RiskLevel::from_score(0, 0, &c), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(29, 0, &c), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(30, 0, &c), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(70, 0, &c), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(71, 0, &c), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(100, 1, &c), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(84, 5, &c), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(85, 2, &c), RiskLevel::Critical);
    }

    #[test]
    fn aggregate_clamps_to_100() {
        let matched: Vec<MatchedRule> = (0..5)
            .map(|i| MatchedRule::from(&rule(&i.to_string(), "x", 60, json!(true))))
            .collect();
        assert_eq!(aggregate(&matched), (300, 100));
        assert_eq!(aggregate(&[]), (0, 0));
    }

    #[tokio::test]
    async fn scenario_both_rules_match() {
        let (engine, _) = engine_with(scenario_rules());
        let entity = tx("t1", json!({ "amount": 9500, "receiverCountryCode": "AF" }));
        let r = engine.evaluate_entity_risk(&entity).await.unwrap();
        assert_eq!(r.matched_rule_ids(), vec!["A", "B"]);
        assert_eq!(r.score, 90);
        assert_eq!(r.level, RiskLevel::High);
        assert_eq!(r.categories, vec!["high_risk_corridor", "transaction"]);
        let weights: f64 = r.factors.iter().map(|f| f.weight).sum();
        assert!((weights - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn scenario_no_rules_match() {
        let (engine, store) = engine_with(scenario_rules());
        let entity = tx("t2", json!({ "amount": 500, "receiverCountryCode": "US" }));
        let r = engine.evaluate_entity_risk(&entity).await.unwrap();
        assert!(r.matched_rules.is_empty());
        assert_eq!(r.score, 0);
        assert_eq!(r.level, RiskLevel::Low);
        assert!(store
            .list_matches("t2", EntityType::Transaction)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn composite_score_is_clamped() {
        let rules = (0..4)
            .map(|i| rule(&format!("R{}", i), "kyc", 70, json!({ "var": "isPep" })))
            .collect();
        let (engine, _) = engine_with(rules);
        let user = EntityRecord::from_json(EntityType::User, json!({ "id": "u1", "isPep": true }))
            .unwrap();
        let r = engine.evaluate_entity_risk(&user).await.unwrap();
        assert_eq!(r.raw_score, 280);
        assert_eq!(r.score, 100);
        assert_eq!(r.level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn malformed_rule_is_isolated() {
        let mut rules = scenario_rules();
        rules.insert(1, rule("BAD", "transaction", 30, json!({ "regex": ["x", "y"] })));
        let (engine, _) = engine_with(rules);
        let entity = tx("t3", json!({ "amount": 9500, "receiverCountryCode": "AF" }));
        let r = engine.evaluate_entity_risk(&entity).await.unwrap();
        assert_eq!(r.matched_rule_ids(), vec!["A", "B"]);
        assert_eq!(r.skipped_rules, vec!["BAD"]);
        assert_eq!(r.score, 90);
    }

    #[tokio::test]
    async fn text_conditions_are_parsed_or_skipped() {
        let rules = vec![
            rule("GARBAGE", "transaction", 40, json!("amount > 9000")),
            rule("TXT", "transaction", 60, json!(r#"{">":[{"var":"amount"},9000]}"#)),
        ];
        let (engine, _) = engine_with(rules);

        let small = tx("t3a", json!({ "amount": 5 }));
        let r = engine.evaluate_entity_risk(&small).await.unwrap();
        assert!(r.matched_rules.is_empty());
        assert_eq!(r.skipped_rules, vec!["GARBAGE"]);
        assert_eq!(r.score, 0);
        assert_eq!(r.level, RiskLevel::Low);

        let large = tx("t3b", json!({ "amount": 9500 }));
        let r = engine.evaluate_entity_risk(&large).await.unwrap();
        assert_eq!(r.matched_rule_ids(), vec!["TXT"]);
        assert_eq!(r.score, 60);
    }

    #[tokio::test]
    async fn inactive_rules_do_not_participate() {
        let mut rules = scenario_rules();
        rules[1].is_active = false;
        let (engine, _) = engine_with(rules);
        let entity = tx("t4", json!({ "amount": 9500, "receiverCountryCode": "AF" }));
        let r = engine.evaluate_entity_risk(&entity).await.unwrap();
        assert_eq!(r.matched_rule_ids(), vec!["A"]);
        assert_eq!(r.level, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn matches_record_evidence() {
        let (engine, store) = engine_with(scenario_rules());
        let entity = tx("t5", json!({ "amount": 9500, "receiverCountryCode": "AF" }));
        engine.evaluate_entity_risk(&entity).await.unwrap();
        let stored = store.list_matches("t5", EntityType::Transaction).await.unwrap();
        assert_eq!(stored.len(), 2);
        let data = &stored[1].risk_match.match_data;
        assert_eq!(data["evidence"], json!({ "receiverCountryCode": "AF" }));
        assert_eq!(data["risk_score"], json!(50));
        assert_eq!(stored[1].rule.as_ref().map(|r| r.rule_id.as_str()), Some("B"));
    }

    #[tokio::test]
    async fn reload_matches_live_result() {
        let (engine, _) = engine_with(scenario_rules());
        let entity = tx("t6", json!({ "amount": 9500, "receiverCountryCode": "IR" }));
        let live = engine.evaluate_entity_risk(&entity).await.unwrap();
        let loaded = engine
            .load_existing_matches("t6", EntityType::Transaction)
            .await
            .unwrap();
        assert_eq!(loaded.matched_rules, live.matched_rules);
        assert_eq!(loaded.score, live.score);
        assert_eq!(loaded.level, live.level);
        assert_eq!(loaded.run_id, live.run_id);
    }

    #[tokio::test]
    async fn reload_follows_latest_run_even_when_empty() {
        let (engine, _) = engine_with(scenario_rules());
        let risky = tx("t7", json!({ "amount": 9500, "receiverCountryCode": "IR" }));
        engine.evaluate_entity_risk(&risky).await.unwrap();
        let clean = tx("t7", json!({ "amount": 10, "receiverCountryCode": "US" }));
        engine.evaluate_entity_risk(&clean).await.unwrap();
        let loaded = engine
            .load_existing_matches("t7", EntityType::Transaction)
            .await
            .unwrap();
        assert!(loaded.matched_rules.is_empty());
        assert_eq!(loaded.score, 0);
    }

    #[tokio::test]
    async fn rerun_appends_new_matches() {
        let (engine, store) = engine_with(scenario_rules());
        let entity = tx("t8", json!({ "amount": 9500, "receiverCountryCode": "AF" }));
        let first = engine.evaluate_entity_risk(&entity).await.unwrap();
        let second = engine.evaluate_entity_risk(&entity).await.unwrap();
        assert_ne!(first.run_id, second.run_id);
        let stored = store.list_matches("t8", EntityType::Transaction).await.unwrap();
        assert_eq!(stored.len(), 4);
    }

    #[tokio::test]
    async fn rule_source_failure_is_reported() {
        let (engine, store) = engine_with(scenario_rules());
        store.fail_reads(true);
        let entity = tx("t9", json!({ "amount": 9500 }));
        let err = engine.evaluate_entity_risk(&entity).await.unwrap_err();
        assert!(matches!(err, RiskError::Repository(_)));
        assert!(err.partial_result().is_none());
    }

    #[tokio::test]
    async fn write_failure_still_returns_result() {
        let (engine, store) = engine_with(scenario_rules());
        store.fail_writes(true);
        let entity = tx("t10", json!({ "amount": 9500, "receiverCountryCode": "AF" }));
        let err = engine.evaluate_entity_risk(&entity).await.unwrap_err();
        match &err {
            RiskError::AuditTrail { failed_writes, .. } => assert_eq!(*failed_writes, 2),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.partial_result().map(|r| r.score), Some(90));
    }

    /// Accepts run summaries but can refuse match writes.
    struct MatchWritesFail {
        inner: Arc<MemoryStore>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl MatchStore for MatchWritesFail {
        async fn record_match(&self, risk_match: &RiskMatch) -> Result<(), StoreError> {
            if self.failing.load(Ordering::Relaxed) {
                return Err(StoreError::Unavailable("risk_matches offline".into()));
            }
            self.inner.record_match(risk_match).await
        }

        async fn record_run(&self, run: &AssessmentRun) -> Result<(), StoreError> {
            self.inner.record_run(run).await
        }

        async fn list_matches(
            &self,
            entity_id: &str,
            entity_type: EntityType,
        ) -> Result<Vec<StoredMatch>, StoreError> {
            self.inner.list_matches(entity_id, entity_type).await
        }

        async fn latest_run(
            &self,
            entity_id: &str,
            entity_type: EntityType,
        ) -> Result<Option<AssessmentRun>, StoreError> {
            self.inner.latest_run(entity_id, entity_type).await
        }
    }

    #[tokio::test]
    async fn failed_match_writes_leave_no_run_behind() {
        let store = Arc::new(MemoryStore::with_rules(scenario_rules()));
        let matches = Arc::new(MatchWritesFail {
            inner: store.clone(),
            failing: AtomicBool::new(false),
        });
        let engine = RiskEngine::new(RiskConfig::default(), store.clone(), matches.clone());

        let first = engine
            .evaluate_entity_risk(&tx("t11", json!({ "amount": 9500, "receiverCountryCode": "AF" })))
            .await
            .unwrap();

        matches.failing.store(true, Ordering::Relaxed);
        let err = engine
            .evaluate_entity_risk(&tx("t11", json!({ "amount": 9500, "receiverCountryCode": "US" })))
            .await
            .unwrap_err();
        match &err {
            RiskError::AuditTrail { failed_writes, .. } => assert_eq!(*failed_writes, 1),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.partial_result().map(|r| r.score), Some(40));

        // the stored run and its matches still agree
        let latest = matches
            .latest_run("t11", EntityType::Transaction)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some(latest.run_id), first.run_id);
        let reloaded = engine
            .load_existing_matches("t11", EntityType::Transaction)
            .await
            .unwrap();
        assert_eq!(reloaded, first);

        // nothing recorded at all for an entity without an earlier run
        let err = engine
            .evaluate_entity_risk(&tx("t12", json!({ "amount": 9500, "receiverCountryCode": "AF" })))
            .await
            .unwrap_err();
        assert!(matches!(err, RiskError::AuditTrail { failed_writes: 2, .. }));
        assert!(matches
            .latest_run("t12", EntityType::Transaction)
            .await
            .unwrap()
            .is_none());
        let reloaded = engine
            .load_existing_matches("t12", EntityType::Transaction)
            .await
            .unwrap();
        assert_eq!(reloaded.run_id, None);
        assert_eq!(reloaded.score, 0);
    }

    #[tokio::test]
    async fn rules_by_category() {
        let (engine, _) = engine_with(scenario_rules());
        assert_eq!(engine.get_rules_by_category("all").await.unwrap().len(), 2);
        let only = engine.get_rules_by_category("transaction").await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].rule_id, "A");
        assert!(engine.get_rules_by_category("kyc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn assess_entity_without_source_is_repository_error() {
        let (engine, _) = engine_with(scenario_rules());
        let err = engine
            .assess_entity("t1", EntityType::Transaction)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RiskError::Repository(StoreError::NotConfigured(_))
        ));
    }

    #[test]
    fn rebuild_falls_back_to_snapshot() {
        let stored = StoredMatch {
            risk_match: RiskMatch {
                id: Uuid::new_v4(),
                rule_id: "GONE".into(),
                entity_id: "e".into(),
                entity_type: EntityType::User,
                run_id: Uuid::new_v4(),
                matched_at: Utc::now(),
                condition_hash: String::new(),
                match_data: json!({ "rule_name": "Old", "category": "kyc", "risk_score": 25 }),
            },
            rule: None,
        };
        let r = rebuild(&stored).unwrap();
        assert_eq!((r.name.as_str(), r.category.as_str(), r.risk_score), ("Old", "kyc", 25));
        let mut bare = stored;
        bare.risk_match.match_data = json!({});
        assert!(rebuild(&bare).is_none());
    }
}
