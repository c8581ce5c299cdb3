//! Entities under assessment: transactions and users.
//!
//! The engine only ever sees an [`EntityRecord`]: an id, an explicit
//! [`EntityType`] discriminant and a field map addressed by the condition
//! grammar. The typed [`Transaction`] and [`User`] records are conveniences
//! for callers and for the pattern detector.

use crate::error::{RiskError, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Transaction,
    User,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Transaction => "transaction",
            EntityType::User => "user",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transaction" => Ok(EntityType::Transaction),
            "user" | "customer" => Ok(EntityType::User),
            other => Err(format!("unknown entity type `{}`", other)),
        }
    }
}

/// Uniform view of an entity for rule evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub entity_type: EntityType,
    pub fields: Map<String, Value>,
}

impl EntityRecord {
    /// Build a record from an id and field map. Transactions always expose
    /// `amount` as an alias of `senderAmount`.
    pub fn new(
        id: impl Into<String>,
        entity_type: EntityType,
        mut fields: Map<String, Value>,
    ) -> Result<Self, RiskError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(RiskError::invalid("id", "entity id must not be empty"));
        }
        if entity_type == EntityType::Transaction && !fields.contains_key("amount") {
            if let Some(amount) = fields.get("senderAmount").cloned() {
                fields.insert("amount".to_string(), amount);
            }
        }
        Ok(Self {
            id,
            entity_type,
            fields,
        })
    }

    /// Build a record from a JSON row. The row must be an object carrying an
    /// `id` (string or number).
    pub fn from_json(entity_type: EntityType, row: Value) -> Result<Self, RiskError> {
        let Value::Object(fields) = row else {
            return Err(RiskError::invalid(
                "entity",
                format!("{} row must be a JSON object", entity_type),
            ));
        };
        let id = match fields.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(RiskError::invalid("id", "missing or non-scalar `id`")),
        };
        Self::new(id, entity_type, fields)
    }
}

/// Lookup of entities by id. Implemented by the store adapters.
#[async_trait]
pub trait EntitySource: Send + Sync {
    async fn fetch_entity(&self, id: &str, entity_type: EntityType)
        -> Result<EntityRecord, StoreError>;
}

/// A payment between a sender and a receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub receiver_id: String,
    #[serde(default)]
    pub receiver_name: String,
    #[serde(alias = "amount")]
    pub sender_amount: f64,
    #[serde(default)]
    pub sender_currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_currency: Option<String>,
    #[serde(default)]
    pub sender_country_code: String,
    #[serde(default)]
    pub receiver_country_code: String,
    /// Carries the local offset at which the transaction was made.
    pub timestamp: DateTime<FixedOffset>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub risk_score: u8,
    #[serde(default)]
    pub is_suspicious: bool,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A customer under KYC review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub country_of_residence: String,
    #[serde(default)]
    pub is_pep: bool,
    #[serde(default)]
    pub is_sanctioned: bool,
    #[serde(default)]
    pub kyc_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<u8>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn to_fields<T: Serialize>(value: &T) -> Result<Map<String, Value>, RiskError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(RiskError::invalid("entity", "did not serialize to an object")),
        Err(e) => Err(RiskError::invalid("entity", e.to_string())),
    }
}

impl TryFrom<&Transaction> for EntityRecord {
    type Error = RiskError;

    fn try_from(tx: &Transaction) -> Result<Self, Self::Error> {
        EntityRecord::new(tx.id.clone(), EntityType::Transaction, to_fields(tx)?)
    }
}

impl TryFrom<&User> for EntityRecord {
    type Error = RiskError;

    fn try_from(user: &User) -> Result<Self, Self::Error> {
        EntityRecord::new(user.id.clone(), EntityType::User, to_fields(user)?)
    }
}
