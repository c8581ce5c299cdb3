//! AML risk engine: rule-based entity scoring and transaction pattern detection.
//!
//! - [`condition`]: JSON condition grammar, parsed once and evaluated against entity fields
//! - [`rules`]: risk rules and the rule source boundary
//! - [`risk`]: evaluation engine, score aggregation and the audit trail
//! - [`patterns`]: structuring, corridor, velocity and time-of-day scans
//! - [`storage`]: SQLite (encrypted) and in-memory stores
//! - [`remote`]: hosted backend over its REST table API
//! - [`logging`]: structured logging and ndjson output

pub mod condition;
pub mod config;
pub mod entity;
pub mod error;
pub mod logging;
pub mod patterns;
pub mod remote;
pub mod risk;
pub mod rules;
pub mod storage;

pub use condition::Condition;
pub use config::EngineConfig;
pub use entity::{EntityRecord, EntitySource, EntityType, Transaction, User};
pub use error::{ConditionError, RiskError, StoreError};
pub use logging::StructuredLogger;
pub use patterns::{detect_patterns, DetectedPattern, PatternCategory, PatternDetector, Severity};
pub use remote::RestBackend;
pub use risk::{MatchStore, RiskAssessmentResult, RiskEngine, RiskLevel, RiskMatch};
pub use rules::{CategoryFilter, Rule, RuleSource};
pub use storage::{MemoryStore, SecureStore};
