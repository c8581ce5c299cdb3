//! In-process store. Used by tests and by callers embedding the engine
//! without a database.

use crate::entity::{EntityRecord, EntitySource, EntityType};
use crate::error::StoreError;
use crate::risk::{AssessmentRun, MatchStore, RiskMatch, StoredMatch};
use crate::rules::{Rule, RuleSource};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    rules: RwLock<Vec<Rule>>,
    entities: RwLock<HashMap<(EntityType, String), EntityRecord>>,
    matches: RwLock<Vec<RiskMatch>>,
    runs: RwLock<Vec<AssessmentRun>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<Rule>) -> Self {
        Self {
            rules: RwLock::new(rules),
            ..Self::default()
        }
    }

    /// Insert or replace by `rule_id`.
    pub fn upsert_rule(&self, rule: Rule) -> Result<(), StoreError> {
        let mut rules = self.rules.write().map_err(|_| StoreError::Poisoned)?;
        match rules.iter_mut().find(|r| r.rule_id == rule.rule_id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
        Ok(())
    }

    pub fn insert_entity(&self, entity: EntityRecord) -> Result<(), StoreError> {
        self.entities
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert((entity.entity_type, entity.id.clone()), entity);
        Ok(())
    }

    /// Make every read fail, to exercise repository error paths.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make every match/run write fail, to exercise audit trail error paths.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store reads disabled".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RuleSource for MemoryStore {
    async fn list_active_rules(&self, category: Option<&str>) -> Result<Vec<Rule>, StoreError> {
        self.check_read()?;
        let rules = self.rules.read().map_err(|_| StoreError::Poisoned)?;
        let mut out: Vec<Rule> = rules
            .iter()
            .filter(|r| r.is_active)
            .filter(|r| category.map_or(true, |c| r.category == c))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        Ok(out)
    }
}

#[async_trait]
impl EntitySource for MemoryStore {
    async fn fetch_entity(
        &self,
        id: &str,
        entity_type: EntityType,
    ) -> Result<EntityRecord, StoreError> {
        self.check_read()?;
        self.entities
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .get(&(entity_type, id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity_type,
                id: id.to_string(),
            })
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn record_match(&self, risk_match: &RiskMatch) -> Result<(), StoreError> {
        self.check_write()?;
        let mut matches = self.matches.write().map_err(|_| StoreError::Poisoned)?;
        let duplicate = matches.iter().any(|m| {
            m.rule_id == risk_match.rule_id
                && m.entity_id == risk_match.entity_id
                && m.entity_type == risk_match.entity_type
                && m.run_id == risk_match.run_id
        });
        if !duplicate {
            matches.push(risk_match.clone());
        }
        Ok(())
    }

    async fn record_run(&self, run: &AssessmentRun) -> Result<(), StoreError> {
        self.check_write()?;
        let mut runs = self.runs.write().map_err(|_| StoreError::Poisoned)?;
        if !runs.iter().any(|r| r.run_id == run.run_id) {
            runs.push(run.clone());
        }
        Ok(())
    }

    async fn list_matches(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Vec<StoredMatch>, StoreError> {
        self.check_read()?;
        let matches = self.matches.read().map_err(|_| StoreError::Poisoned)?;
        let rules = self.rules.read().map_err(|_| StoreError::Poisoned)?;
        let mut out: Vec<StoredMatch> = matches
            .iter()
            .filter(|m| m.entity_id == entity_id && m.entity_type == entity_type)
            .map(|m| StoredMatch {
                risk_match: m.clone(),
                rule: rules.iter().find(|r| r.rule_id == m.rule_id).cloned(),
            })
            .collect();
        // stable: equal timestamps keep insertion order
        out.sort_by_key(|s| s.risk_match.matched_at);
        Ok(out)
    }

    async fn latest_run(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<AssessmentRun>, StoreError> {
        self.check_read()?;
        let runs = self.runs.read().map_err(|_| StoreError::Poisoned)?;
        Ok(runs
            .iter()
            .filter(|r| r.entity_id == entity_id && r.entity_type == entity_type)
            .fold(None, |latest: Option<&AssessmentRun>, r| match latest {
                Some(l) if l.completed_at > r.completed_at => Some(l),
                _ => Some(r),
            })
            .cloned())
    }
}
