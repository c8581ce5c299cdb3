//! Engine configuration, loaded from a JSON file with defaults for every section.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Data directory (SQLite store)
    pub data_dir: PathBuf,
    /// Where rules, entities and matches live
    pub store: StoreConfig,
    /// Score thresholds for level derivation
    pub risk: RiskConfig,
    /// Pattern detector parameters
    pub patterns: PatternConfig,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sqlite,
    Rest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub rest: RestConfig,
}

/// Hosted backend table API. Timeouts and retries are owned here, not by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Scores at or above this are medium
    pub medium_threshold: u8,
    /// Scores at or above this are high
    pub high_threshold: u8,
    /// Scores at or above this may be critical (see `critical_min_high_severity`)
    pub critical_threshold: u8,
    /// A matched rule with at least this score counts as high severity
    pub high_severity_rule_score: u32,
    /// High-severity matches needed before a score can be critical
    pub critical_min_high_severity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Reporting trigger; structuring band ends just below it
    pub reporting_threshold: f64,
    /// Lower bound (inclusive) of the structuring band
    pub structuring_lower_bound: f64,
    /// ISO 3166 alpha-2 receiver countries treated as high-risk corridors
    pub high_risk_countries: Vec<String>,
    pub velocity_window_hours: u32,
    /// A sender with more than this many transactions in one window is flagged
    pub velocity_max_transactions: usize,
    /// First business hour (inclusive, local time)
    pub business_hours_start: u32,
    /// End of business hours (exclusive, local time)
    pub business_hours_end: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".aml"),
            store: StoreConfig::default(),
            risk: RiskConfig::default(),
            patterns: PatternConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            rest: RestConfig::default(),
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: 15,
            connect_timeout_secs: 5,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            medium_threshold: 30,
            high_threshold: 71,
            critical_threshold: 85,
            high_severity_rule_score: 50,
            critical_min_high_severity: 2,
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            reporting_threshold: 10_000.0,
            structuring_lower_bound: 9_000.0,
            high_risk_countries: ["AF", "IR", "KP", "SY", "YE", "MM", "CU", "VE", "RU", "BY"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            velocity_window_hours: 24,
            velocity_max_transactions: 5,
            business_hours_start: 6,
            business_hours_end: 22,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl RiskConfig {
    /// Bands must stay contiguous: 0 < medium <= high <= critical <= 100.
    pub fn validate(&self) -> Result<(), String> {
        let ordered = 0 < self.medium_threshold
            && self.medium_threshold <= self.high_threshold
            && self.high_threshold <= self.critical_threshold
            && self.critical_threshold <= 100;
        if ordered {
            Ok(())
        } else {
            Err(format!(
                "risk thresholds out of order: medium={} high={} critical={}",
                self.medium_threshold, self.high_threshold, self.critical_threshold
            ))
        }
    }
}

impl PatternConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.structuring_lower_bound < self.reporting_threshold) {
            return Err("structuring_lower_bound must be below reporting_threshold".into());
        }
        if self.business_hours_start > 23 || self.business_hours_end > 24 {
            return Err("business hours must be within 0..=24".into());
        }
        if self.business_hours_start >= self.business_hours_end {
            return Err("business_hours_start must precede business_hours_end".into());
        }
        if self.velocity_window_hours == 0 {
            return Err("velocity_window_hours must be positive".into());
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Load from JSON file if present; otherwise return default
    pub fn load(path: &std::path::Path) -> Self {
        if path.exists() {
            if let Ok(data) = std::fs::read_to_string(path) {
                if let Ok(c) = serde_json::from_str::<EngineConfig>(&data) {
                    return c;
                }
            }
        }
        Self::default()
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("risk.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds_are_contiguous() {
        assert!(RiskConfig::default().validate().is_ok());
        assert!(PatternConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: EngineConfig =
            serde_json::from_str(r#"{"risk":{"critical_threshold":90},"store":{"backend":"rest"}}"#)
                .unwrap();
        assert_eq!(c.risk.critical_threshold, 90);
        assert_eq!(c.risk.medium_threshold, 30);
        assert_eq!(c.store.backend, BackendKind::Rest);
        assert_eq!(c.patterns.velocity_window_hours, 24);
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let c = RiskConfig {
            high_threshold: 20,
            ..RiskConfig::default()
        };
        assert!(c.validate().is_err());
    }
}
