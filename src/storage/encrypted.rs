//! SQLite-backed store with AES-GCM encryption of sensitive columns (entity
//! fields and match evidence). Key derived from a store secret.

use crate::entity::{EntityRecord, EntitySource, EntityType};
use crate::error::StoreError;
use crate::risk::{AssessmentRun, MatchStore, RiskLevel, RiskMatch, StoredMatch};
use crate::rules::{Rule, RuleSource};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task;
use uuid::Uuid;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS risk_rules (
        rule_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        category TEXT NOT NULL,
        risk_score INTEGER NOT NULL,
        is_active INTEGER NOT NULL,
        condition TEXT NOT NULL,
        created_at TEXT,
        updated_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_rules_category ON risk_rules(category);
    CREATE TABLE IF NOT EXISTS entities (
        entity_type TEXT NOT NULL,
        id TEXT NOT NULL,
        fields_enc TEXT NOT NULL,
        PRIMARY KEY (entity_type, id)
    );
    CREATE TABLE IF NOT EXISTS risk_matches (
        id TEXT PRIMARY KEY,
        rule_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        run_id TEXT NOT NULL,
        matched_at TEXT NOT NULL,
        condition_hash TEXT NOT NULL,
        match_data_enc TEXT NOT NULL,
        UNIQUE (rule_id, entity_id, entity_type, run_id)
    );
    CREATE INDEX IF NOT EXISTS idx_matches_entity ON risk_matches(entity_type, entity_id, matched_at);
    CREATE TABLE IF NOT EXISTS assessment_runs (
        run_id TEXT PRIMARY KEY,
        entity_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        score INTEGER NOT NULL,
        raw_score INTEGER NOT NULL,
        level TEXT NOT NULL,
        rules_evaluated INTEGER NOT NULL,
        rules_skipped TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_runs_entity ON assessment_runs(entity_type, entity_id, completed_at);
"#;

fn derive_key(seed: &[u8]) -> [u8; KEY_LEN] {
    use ring::digest;
    let mut out = [0u8; KEY_LEN];
    let h = digest::digest(&digest::SHA256, seed);
    out[..h.as_ref().len().min(KEY_LEN)].copy_from_slice(h.as_ref());
    out
}

fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String, StoreError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| StoreError::Crypto(e.to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| StoreError::Crypto("encryption failed".into()))?;
    let mut out = nonce.to_vec();
    out.extend(ciphertext);
    Ok(BASE64.encode(&out))
}

fn decrypt(key: &[u8; KEY_LEN], encoded: &str) -> Result<Vec<u8>, StoreError> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| StoreError::Crypto(e.to_string()))?;
    if raw.len() < NONCE_LEN {
        return Err(StoreError::Crypto("payload too short".into()));
    }
    let (nonce, ct) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| StoreError::Crypto(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| StoreError::Crypto("decryption failed (wrong secret?)".into()))
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRow(format!("timestamp `{}`: {}", s, e)))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidRow(format!("uuid `{}`: {}", s, e)))
}

fn parse_entity_type(s: &str) -> Result<EntityType, StoreError> {
    s.parse().map_err(StoreError::InvalidRow)
}

fn parse_level(s: &str) -> Result<RiskLevel, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(StoreError::from)
}

/// Rule columns as read from SQLite, before JSON/timestamp parsing.
struct RuleRow {
    rule_id: String,
    name: String,
    description: String,
    category: String,
    risk_score: i64,
    is_active: bool,
    condition: String,
    created_at: Option<String>,
    updated_at: Option<String>,
}

const RULE_COLUMNS: &str =
    "rule_id, name, description, category, risk_score, is_active, condition, created_at, updated_at";

impl RuleRow {
    fn read(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            rule_id: row.get(offset)?,
            name: row.get(offset + 1)?,
            description: row.get(offset + 2)?,
            category: row.get(offset + 3)?,
            risk_score: row.get(offset + 4)?,
            is_active: row.get(offset + 5)?,
            condition: row.get(offset + 6)?,
            created_at: row.get(offset + 7)?,
            updated_at: row.get(offset + 8)?,
        })
    }

    fn into_rule(self) -> Result<Rule, StoreError> {
        Ok(Rule {
            risk_score: u32::try_from(self.risk_score).map_err(|_| {
                StoreError::InvalidRow(format!("rule `{}` has negative score", self.rule_id))
            })?,
            condition: serde_json::from_str(&self.condition)?,
            created_at: self.created_at.as_deref().map(parse_ts).transpose()?,
            updated_at: self.updated_at.as_deref().map(parse_ts).transpose()?,
            rule_id: self.rule_id,
            name: self.name,
            description: self.description,
            category: self.category,
            is_active: self.is_active,
        })
    }
}

struct MatchRow {
    id: String,
    rule_id: String,
    entity_id: String,
    entity_type: String,
    run_id: String,
    matched_at: String,
    condition_hash: String,
    match_data_enc: String,
}

struct RunRow {
    run_id: String,
    entity_id: String,
    entity_type: String,
    score: i64,
    raw_score: i64,
    level: String,
    rules_evaluated: i64,
    rules_skipped: String,
    started_at: String,
    completed_at: String,
}

impl RunRow {
    fn into_run(self) -> Result<AssessmentRun, StoreError> {
        let int = |v: i64, what: &str| {
            StoreError::InvalidRow(format!("run `{}`: {} out of range: {}", self.run_id, what, v))
        };
        Ok(AssessmentRun {
            run_id: parse_uuid(&self.run_id)?,
            entity_id: self.entity_id.clone(),
            entity_type: parse_entity_type(&self.entity_type)?,
            score: u8::try_from(self.score).map_err(|_| int(self.score, "score"))?,
            raw_score: u32::try_from(self.raw_score).map_err(|_| int(self.raw_score, "raw_score"))?,
            level: parse_level(&self.level)?,
            rules_evaluated: usize::try_from(self.rules_evaluated)
                .map_err(|_| int(self.rules_evaluated, "rules_evaluated"))?,
            rules_skipped: serde_json::from_str(&self.rules_skipped)?,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_ts(&self.completed_at)?,
        })
    }
}

/// Connection and key. All calls block; async callers go through
/// `SecureStore::blocking`.
struct Db {
    conn: Mutex<Connection>,
    key: [u8; KEY_LEN],
}

impl Db {
    fn init(conn: Connection, secret: &[u8]) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            key: derive_key(secret),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let now = Utc::now();
        let created = ts(rule.created_at.as_ref().unwrap_or(&now));
        let updated = ts(rule.updated_at.as_ref().unwrap_or(&now));
        self.conn()?.execute(
            r#"INSERT INTO risk_rules
                (rule_id, name, description, category, risk_score, is_active, condition, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT(rule_id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                category = excluded.category,
                risk_score = excluded.risk_score,
                is_active = excluded.is_active,
                condition = excluded.condition,
                updated_at = excluded.updated_at"#,
            params![
                rule.rule_id,
                rule.name,
                rule.description,
                rule.category,
                i64::from(rule.risk_score),
                rule.is_active,
                serde_json::to_string(&rule.condition)?,
                created,
                updated,
            ],
        )?;
        Ok(())
    }

    fn insert_entity(&self, entity: &EntityRecord) -> Result<(), StoreError> {
        let enc = encrypt(&self.key, serde_json::to_string(&entity.fields)?.as_bytes())?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO entities (entity_type, id, fields_enc) VALUES (?1, ?2, ?3)",
            params![entity.entity_type.as_str(), entity.id, enc],
        )?;
        Ok(())
    }

    fn select_rules(&self, category: Option<&str>) -> Result<Vec<Rule>, StoreError> {
        let rows: Vec<RuleRow> = {
            let conn = self.conn()?;
            let sql = format!(
                "SELECT {} FROM risk_rules WHERE is_active = 1 AND (?1 IS NULL OR category = ?1) ORDER BY rule_id",
                RULE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![category], |row| RuleRow::read(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(RuleRow::into_rule).collect()
    }

    fn select_entity(&self, id: &str, entity_type: EntityType) -> Result<EntityRecord, StoreError> {
        let enc: Option<String> = self
            .conn()?
            .query_row(
                "SELECT fields_enc FROM entities WHERE entity_type = ?1 AND id = ?2",
                params![entity_type.as_str(), id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(enc) = enc else {
            return Err(StoreError::NotFound {
                entity_type,
                id: id.to_string(),
            });
        };
        let fields = serde_json::from_slice(&decrypt(&self.key, &enc)?)?;
        EntityRecord::new(id, entity_type, fields).map_err(|e| StoreError::InvalidRow(e.to_string()))
    }

    fn insert_match(&self, m: &RiskMatch) -> Result<(), StoreError> {
        let enc = encrypt(&self.key, serde_json::to_string(&m.match_data)?.as_bytes())?;
        self.conn()?.execute(
            r#"INSERT OR IGNORE INTO risk_matches
                (id, rule_id, entity_id, entity_type, run_id, matched_at, condition_hash, match_data_enc)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                m.id.to_string(),
                m.rule_id,
                m.entity_id,
                m.entity_type.as_str(),
                m.run_id.to_string(),
                ts(&m.matched_at),
                m.condition_hash,
                enc,
            ],
        )?;
        Ok(())
    }

    fn insert_run(&self, run: &AssessmentRun) -> Result<(), StoreError> {
        self.conn()?.execute(
            r#"INSERT OR IGNORE INTO assessment_runs
                (run_id, entity_id, entity_type, score, raw_score, level, rules_evaluated, rules_skipped, started_at, completed_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                run.run_id.to_string(),
                run.entity_id,
                run.entity_type.as_str(),
                i64::from(run.score),
                i64::from(run.raw_score),
                run.level.as_str(),
                i64::try_from(run.rules_evaluated).unwrap_or(i64::MAX),
                serde_json::to_string(&run.rules_skipped)?,
                ts(&run.started_at),
                ts(&run.completed_at),
            ],
        )?;
        Ok(())
    }

    fn select_matches(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Vec<StoredMatch>, StoreError> {
        let rows: Vec<(MatchRow, Option<RuleRow>)> = {
            let conn = self.conn()?;
            let sql = format!(
                r#"SELECT m.id, m.rule_id, m.entity_id, m.entity_type, m.run_id, m.matched_at,
                          m.condition_hash, m.match_data_enc, r.rule_id IS NOT NULL, {}
                   FROM risk_matches m
                   LEFT JOIN risk_rules r ON r.rule_id = m.rule_id
                   WHERE m.entity_type = ?1 AND m.entity_id = ?2
                   ORDER BY m.matched_at, m.rowid"#,
                RULE_COLUMNS
                    .split(", ")
                    .map(|c| format!("r.{}", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![entity_type.as_str(), entity_id], |row| {
                    let m = MatchRow {
                        id: row.get(0)?,
                        rule_id: row.get(1)?,
                        entity_id: row.get(2)?,
                        entity_type: row.get(3)?,
                        run_id: row.get(4)?,
                        matched_at: row.get(5)?,
                        condition_hash: row.get(6)?,
                        match_data_enc: row.get(7)?,
                    };
                    let has_rule: bool = row.get(8)?;
                    let rule = if has_rule {
                        Some(RuleRow::read(row, 9)?)
                    } else {
                        None
                    };
                    Ok((m, rule))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.into_iter()
            .map(|(m, rule)| {
                let match_data = serde_json::from_slice(&decrypt(&self.key, &m.match_data_enc)?)?;
                Ok(StoredMatch {
                    risk_match: RiskMatch {
                        id: parse_uuid(&m.id)?,
                        rule_id: m.rule_id,
                        entity_id: m.entity_id,
                        entity_type: parse_entity_type(&m.entity_type)?,
                        run_id: parse_uuid(&m.run_id)?,
                        matched_at: parse_ts(&m.matched_at)?,
                        condition_hash: m.condition_hash,
                        match_data,
                    },
                    rule: rule.map(RuleRow::into_rule).transpose()?,
                })
            })
            .collect()
    }

    fn select_latest_run(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<AssessmentRun>, StoreError> {
        let row: Option<RunRow> = self
            .conn()?
            .query_row(
                r#"SELECT run_id, entity_id, entity_type, score, raw_score, level,
                          rules_evaluated, rules_skipped, started_at, completed_at
                   FROM assessment_runs
                   WHERE entity_type = ?1 AND entity_id = ?2
                   ORDER BY completed_at DESC, rowid DESC
                   LIMIT 1"#,
                params![entity_type.as_str(), entity_id],
                |row| {
                    Ok(RunRow {
                        run_id: row.get(0)?,
                        entity_id: row.get(1)?,
                        entity_type: row.get(2)?,
                        score: row.get(3)?,
                        raw_score: row.get(4)?,
                        level: row.get(5)?,
                        rules_evaluated: row.get(6)?,
                        rules_skipped: row.get(7)?,
                        started_at: row.get(8)?,
                        completed_at: row.get(9)?,
                    })
                },
            )
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }
}

/// Encrypted SQLite store. The seeding methods are synchronous; the async
/// trait impls run each query on tokio's blocking pool.
#[derive(Clone)]
pub struct SecureStore {
    db: Arc<Db>,
}

impl SecureStore {
    /// Open or create DB at path. Key is derived from `secret`.
    pub fn open(path: &Path, secret: &[u8]) -> Result<Self, StoreError> {
        Self::from_conn(Connection::open(path)?, secret)
    }

    pub fn open_in_memory(secret: &[u8]) -> Result<Self, StoreError> {
        Self::from_conn(Connection::open_in_memory()?, secret)
    }

    fn from_conn(conn: Connection, secret: &[u8]) -> Result<Self, StoreError> {
        Ok(Self {
            db: Arc::new(Db::init(conn, secret)?),
        })
    }

    /// Insert or update a rule by `rule_id`. `created_at` of an existing rule is kept.
    pub fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        self.db.upsert_rule(rule)
    }

    /// Insert or replace an entity (fields stored encrypted).
    pub fn insert_entity(&self, entity: &EntityRecord) -> Result<(), StoreError> {
        self.db.insert_entity(entity)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Db) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

#[async_trait]
impl RuleSource for SecureStore {
    async fn list_active_rules(&self, category: Option<&str>) -> Result<Vec<Rule>, StoreError> {
        let category = category.map(str::to_string);
        self.blocking(move |db| db.select_rules(category.as_deref()))
            .await
    }
}

#[async_trait]
impl EntitySource for SecureStore {
    async fn fetch_entity(
        &self,
        id: &str,
        entity_type: EntityType,
    ) -> Result<EntityRecord, StoreError> {
        let id = id.to_string();
        self.blocking(move |db| db.select_entity(&id, entity_type))
            .await
    }
}

#[async_trait]
impl MatchStore for SecureStore {
    async fn record_match(&self, risk_match: &RiskMatch) -> Result<(), StoreError> {
        let risk_match = risk_match.clone();
        self.blocking(move |db| db.insert_match(&risk_match)).await
    }

    async fn record_run(&self, run: &AssessmentRun) -> Result<(), StoreError> {
        let run = run.clone();
        self.blocking(move |db| db.insert_run(&run)).await
    }

    async fn list_matches(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Vec<StoredMatch>, StoreError> {
        let entity_id = entity_id.to_string();
        self.blocking(move |db| db.select_matches(&entity_id, entity_type))
            .await
    }

    async fn latest_run(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<Option<AssessmentRun>, StoreError> {
        let entity_id = entity_id.to_string();
        self.blocking(move |db| db.select_latest_run(&entity_id, entity_type))
            .await
    }
}
