//! Hosted backend adapter: rules, entities, matches and runs over a
//! PostgREST-style table API.

use crate::config::RestConfig;
use crate::entity::{EntityRecord, EntitySource, EntityType};
use crate::error::StoreError;
use crate::risk::{AssessmentRun, MatchStore, RiskMatch, StoredMatch};
use crate::rules::{Rule, RuleSource};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

const RULES: &str = "/rest/v1/risk_rules";
const MATCHES: &str = "/rest/v1/risk_matches";
const RUNS: &str = "/rest/v1/risk_assessment_runs";

type Query = Vec<(&'static str, String)>;

fn entity_table(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Transaction => "/rest/v1/transactions",
        EntityType::User => "/rest/v1/users",
    }
}

fn eq(v: &str) -> String {
    format!("eq.{}", v)
}

/// `in.("a","b")`, quoting so ids may carry commas or parentheses.
fn in_list<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    let quoted: Vec<String> = values
        .into_iter()
        .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

fn active_rules_query(category: Option<&str>) -> Query {
    let mut q = vec![("is_active", eq("true"))];
    if let Some(c) = category {
        q.push(("category", eq(c)));
    }
    q.push(("order", "rule_id.asc".to_string()));
    q
}

fn entity_scope(entity_id: &str, entity_type: EntityType) -> Query {
    vec![
        ("entity_id", eq(entity_id)),
        ("entity_type", eq(entity_type.as_str())),
    ]
}

pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
}

impl RestBackend {
    pub fn new(config: &RestConfig) -> Result<Self, StoreError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(|e| e.trim_end_matches('/'))
            .filter(|e| !e.is_empty())
            .ok_or_else(|| StoreError::NotConfigured("store.rest.endpoint".into()))?;

        let mut headers = HeaderMap::new();
        if let Some(key) = config.api_key.as_deref() {
            let invalid = |_| StoreError::NotConfigured("store.rest.api_key is not a valid header".into());
            headers.insert("apikey", HeaderValue::from_str(key).map_err(invalid)?);
            let mut bearer =
                HeaderValue::from_str(&format!("Bearer {}", key)).map_err(invalid)?;
            bearer.set_sensitive(true);
            headers.insert(AUTHORIZATION, bearer);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: endpoint.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &Query) -> Result<Vec<T>, StoreError> {
        let res = self.client.get(self.url(path)).query(query).send().await?;
        let res = check(res).await?;
        Ok(res.json().await?)
    }

    /// Insert, ignoring rows whose unique key already exists.
    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        on_conflict: &str,
        body: &T,
    ) -> Result<(), StoreError> {
        let res = self
            .client
            .post(self.url(path))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(body)
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    async fn rules_by_id(&self, ids: &BTreeSet<&str>) -> Result<HashMap<String, Rule>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let query = vec![("rule_id", in_list(ids.iter().copied()))];
        let rules: Vec<Rule> = self.get(RULES, &query).await?;
        Ok(rules.into_iter().map(|r| (r.rule_id.clone(), r)).collect())
    }
}

async fn check(res: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), "backend request failed");
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl RuleSource for RestBackend {
    async fn list_active_rules(&self, category: Option<&str>) -> Result<Vec<Rule>, StoreError> {
        let rules: Vec<Rule> = self.get(RULES, &active_rules_query(category)).await?;
        debug!(count = rules.len(), category = ?category, "fetched rules");
        Ok(rules)
    }
}

#[async_trait]
impl EntitySource for RestBackend {
    async fn fetch_entity(
        &self,
        id: &str,
        entity_type: EntityType,
    ) -> Result<EntityRecord, StoreError> {
        let query = vec![("id", eq(id)), ("limit", "1".to_string())];
        let rows: Vec<Value> = self.get(entity_table(entity_type), &query).await?;
        let row = rows.into_iter().next().ok_or_else(|| StoreError::NotFound {
            entity_type,
            id: id.to_string(),
        })?;
        EntityRecord::from_json(entity_type, row).map_err(|e| StoreError::InvalidRow(e.to_string()))
    }
}

#[async_trait]
impl MatchStore for RestBackend {
    async fn record_match(&self, risk_match: &RiskMatch) -> Result<(), StoreError> {
        self.post(
            MATCHES,
            "rule_id,entity_id,entity_type,run_id",
            std::slice::from_ref(risk_match),
        )
        .await
    }

    async fn record_run(&self, run: &AssessmentRun) -> Result<(), StoreError> {
        self.post(RUNS, "run_id", std::slice::from_ref(run)).await
    }

    async fn list_matches(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Vec<StoredMatch>, StoreError> {
        let mut query = entity_scope(entity_id, entity_type);
        query.push(("order", "matched_at.asc".to_string()));
        let matches: Vec<RiskMatch> = self.get(MATCHES, &query).await?;
        let ids: BTreeSet<&str> = matches.iter().map(|m| m.rule_id.as_str()).collect();
        let rules = self.rules_by_id(&ids).await?;
        Ok(matches
            .into_iter()
            .map(|m| StoredMatch {
                rule: rules.get(&m.rule_id).cloned(),
                risk_match: m,
            })
            .collect())
    }

    async fn latest_run(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<AssessmentRun>, StoreError> {
        let mut query = entity_scope(entity_id, entity_type);
        query.push(("order", "completed_at.desc".to_string()));
        query.push(("limit", "1".to_string()));
        let runs: Vec<AssessmentRun> = self.get(RUNS, &query).await?;
        Ok(runs.into_iter().next())
    }
}
