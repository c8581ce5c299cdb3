//! Four independent scans over a transaction batch.

use super::{DetectedPattern, PatternCategory};
use crate::config::PatternConfig;
use crate::entity::Transaction;
use crate::error::RiskError;
use chrono::{Duration, Timelike, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

pub struct PatternDetector {
    config: PatternConfig,
    corridors: HashSet<String>,
}

impl PatternDetector {
    pub fn new(config: PatternConfig) -> Self {
        let corridors = config
            .high_risk_countries
            .iter()
            .map(|c| c.trim().to_ascii_uppercase())
            .collect();
        Self { config, corridors }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    /// One [`DetectedPattern`] per category, zero-count ones included.
    /// Empty input is not an error.
    pub fn detect(&self, transactions: &[Transaction]) -> Result<Vec<DetectedPattern>, RiskError> {
        validate(transactions)?;
        let detected_at = Utc::now();
        let patterns: Vec<DetectedPattern> = PatternCategory::ALL
            .iter()
            .map(|category| {
                let hits = match category {
                    PatternCategory::Structuring => self.structuring(transactions),
                    PatternCategory::HighRiskCorridor => self.corridor(transactions),
                    PatternCategory::Velocity => self.velocity(transactions),
                    PatternCategory::TimeOfDay => self.time_of_day(transactions),
                };
                summarize(*category, transactions, &hits, detected_at)
            })
            .collect();
        debug!(
            transactions = transactions.len(),
            flagged = patterns.iter().filter(|p| p.count > 0).count(),
            "pattern scan complete"
        );
        Ok(patterns)
    }

    fn structuring(&self, txs: &[Transaction]) -> Vec<usize> {
        let lower = self.config.structuring_lower_bound;
        let upper = self.config.reporting_threshold;
        indices(txs, |tx| tx.sender_amount >= lower && tx.sender_amount < upper)
    }

    fn corridor(&self, txs: &[Transaction]) -> Vec<usize> {
        indices(txs, |tx| {
            self.corridors
                .contains(&tx.receiver_country_code.trim().to_ascii_uppercase())
        })
    }

    /// Flags every transaction inside any per-sender window holding more than
    /// `velocity_max_transactions`.
    fn velocity(&self, txs: &[Transaction]) -> Vec<usize> {
        let window = Duration::hours(i64::from(self.config.velocity_window_hours));
        let max = self.config.velocity_max_transactions;

        let mut by_sender: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, tx) in txs.iter().enumerate() {
            by_sender.entry(tx.sender_id.as_str()).or_default().push(i);
        }

        let mut flagged = BTreeSet::new();
        for idx in by_sender.values_mut() {
            idx.sort_by_key(|&i| (txs[i].timestamp.with_timezone(&Utc), i));
            let mut start = 0;
            for end in 0..idx.len() {
                let end_ts = txs[idx[end]].timestamp;
                while start < end && end_ts - txs[idx[start]].timestamp >= window {
                    start += 1;
                }
                if end - start + 1 > max {
                    flagged.extend(idx[start..=end].iter().copied());
                }
            }
        }
        flagged.into_iter().collect()
    }

    fn time_of_day(&self, txs: &[Transaction]) -> Vec<usize> {
        let start = self.config.business_hours_start;
        let end = self.config.business_hours_end;
        indices(txs, |tx| {
            let hour = tx.timestamp.hour();
            hour < start || hour >= end
        })
    }
}

/// Detect with default thresholds.
pub fn detect_patterns(transactions: &[Transaction]) -> Result<Vec<DetectedPattern>, RiskError> {
    PatternDetector::new(PatternConfig::default()).detect(transactions)
}

fn validate(txs: &[Transaction]) -> Result<(), RiskError> {
    for tx in txs {
        if tx.id.trim().is_empty() {
            return Err(RiskError::invalid("id", "transaction id must not be empty"));
        }
        if !tx.sender_amount.is_finite() || tx.sender_amount < 0.0 {
            return Err(RiskError::invalid(
                "senderAmount",
                format!("transaction `{}` has invalid amount {}", tx.id, tx.sender_amount),
            ));
        }
    }
    Ok(())
}

fn indices(txs: &[Transaction], pred: impl Fn(&Transaction) -> bool) -> Vec<usize> {
    txs.iter()
        .enumerate()
        .filter(|(_, tx)| pred(tx))
        .map(|(i, _)| i)
        .collect()
}

fn summarize(
    category: PatternCategory,
    txs: &[Transaction],
    hits: &[usize],
    detected_at: chrono::DateTime<Utc>,
) -> DetectedPattern {
    DetectedPattern {
        pattern_id: category.id().to_string(),
        name: category.name().to_string(),
        description: category.description().to_string(),
        category,
        severity: category.severity(),
        count: hits.len(),
        total_amount: hits.iter().map(|&i| txs[i].sender_amount).sum(),
        detected_at,
        transaction_ids: hits.iter().map(|&i| txs[i].id.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::Severity;
    use chrono::{DateTime, FixedOffset};
    use serde_json::Map;

    fn at(rfc3339: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap()
    }

    fn tx(id: &str, amount: f64) -> Transaction {
        Transaction {
            id: id.into(),
            sender_id: "s1".into(),
            sender_name: String::new(),
            receiver_id: "r1".into(),
            receiver_name: String::new(),
            sender_amount: amount,
            sender_currency: "USD".into(),
            receiver_amount: None,
            receiver_currency: None,
            sender_country_code: "US".into(),
            receiver_country_code: "GB".into(),
            timestamp: at("2024-03-01T12:00:00+00:00"),
            status: "completed".into(),
            risk_score: 0,
            is_suspicious: false,
            flags: Vec::new(),
            extra: Map::new(),
        }
    }

    fn find(patterns: &[DetectedPattern], c: PatternCategory) -> &DetectedPattern {
        patterns.iter().find(|p| p.category == c).unwrap()
    }

    #[test]
    fn structuring_band_is_half_open() {
        let txs = vec![
            tx("a", 9_999.0),
            tx("b", 10_001.0),
            tx("c", 9_000.0),
            tx("d", 8_999.99),
            tx("e", 10_000.0),
        ];
        let out = detect_patterns(&txs).unwrap();
        let s = find(&out, PatternCategory::Structuring);
        assert_eq!(s.transaction_ids, vec!["a", "c"]);
        assert_eq!(s.severity, Severity::High);
        assert_eq!(s.total_amount, 18_999.0);
    }

    #[test]
    fn empty_input_gives_four_zero_patterns() {
        let out = detect_patterns(&[]).unwrap();
        assert_eq!(
            out.iter().map(|p| p.category).collect::<Vec<_>>(),
            PatternCategory::ALL.to_vec()
        );
        assert!(out.iter().all(|p| p.count == 0 && p.transaction_ids.is_empty()));
    }

    #[test]
    fn corridor_follows_receiver_country() {
        let mut t = tx("a", 100.0);
        t.receiver_country_code = "ir".into();
        let out = detect_patterns(std::slice::from_ref(&t)).unwrap();
        assert_eq!(find(&out, PatternCategory::HighRiskCorridor).count, 1);

        t.receiver_country_code = "DE".into();
        let out = detect_patterns(std::slice::from_ref(&t)).unwrap();
        assert_eq!(find(&out, PatternCategory::HighRiskCorridor).count, 0);
    }

    #[test]
    fn velocity_flags_burst_within_window_only() {
        let mut txs: Vec<Transaction> = (0..6)
            .map(|i| {
                let mut t = tx(&format!("burst-{}", i), 50.0);
                t.timestamp = at(&format!("2024-03-01T1{}:00:00+00:00", i));
                t
            })
            .collect();
        let mut other = tx("other", 50.0);
        other.sender_id = "s2".into();
        txs.push(other);
        let mut late = tx("late", 50.0);
        late.timestamp = at("2024-03-05T12:00:00+00:00");
        txs.push(late);

        let out = detect_patterns(&txs).unwrap();
        let v = find(&out, PatternCategory::Velocity);
        assert_eq!(v.count, 6);
        assert!(v.transaction_ids.iter().all(|id| id.starts_with("burst-")));
    }

    #[test]
    fn velocity_at_limit_is_not_flagged() {
        let txs: Vec<Transaction> = (0..5).map(|i| tx(&format!("t{}", i), 1.0)).collect();
        let out = detect_patterns(&txs).unwrap();
        assert_eq!(find(&out, PatternCategory::Velocity).count, 0);
    }

    #[test]
    fn time_of_day_uses_local_hour() {
        let mut night = tx("night", 10.0);
        night.timestamp = at("2024-03-01T03:30:00+02:00");
        // 23:00 local is outside business hours even though it is 12:00 UTC
        let mut shifted = tx("shifted", 10.0);
        shifted.timestamp = at("2024-03-01T23:00:00+11:00");
        let day = tx("day", 10.0);
        let out = detect_patterns(&[night, day, shifted]).unwrap();
        let t = find(&out, PatternCategory::TimeOfDay);
        assert_eq!(t.transaction_ids, vec!["night", "shifted"]);
        assert_eq!(t.severity, Severity::Low);
    }

    #[test]
    fn invalid_transactions_are_rejected() {
        let err = detect_patterns(&[tx("", 1.0)]).unwrap_err();
        assert!(matches!(err, RiskError::InvalidInput { .. }));
        let err = detect_patterns(&[tx("a", f64::NAN)]).unwrap_err();
        assert!(matches!(err, RiskError::InvalidInput { .. }));
        let err = detect_patterns(&[tx("a", -5.0)]).unwrap_err();
        assert!(matches!(err, RiskError::InvalidInput { .. }));
    }

    #[test]
    fn custom_thresholds_apply() {
        let detector = PatternDetector::new(PatternConfig {
            reporting_threshold: 3_000.0,
            structuring_lower_bound: 2_500.0,
            ..PatternConfig::default()
        });
        let out = detector.detect(&[tx("a", 2_600.0), tx("b", 9_500.0)]).unwrap();
        assert_eq!(find(&out, PatternCategory::Structuring).transaction_ids, vec!["a"]);
    }
}
