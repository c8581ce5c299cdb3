//! One JSON object per line (ndjson), both for tracing output and for
//! assessment results written by the CLI.

use crate::entity::EntityType;
use crate::patterns::DetectedPattern;
use crate::risk::{RiskAssessmentResult, StoredMatch};
use serde::Serialize;
use std::io::{self, Write};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// A result line. `kind` tags the variant so consumers can split the stream.
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputLine<'a> {
    Assessment {
        result: &'a RiskAssessmentResult,
    },
    /// Entity could not be assessed, or was assessed but not fully audited
    /// (then `partial` carries the computed result).
    Failure {
        entity_id: &'a str,
        entity_type: EntityType,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        partial: Option<&'a RiskAssessmentResult>,
    },
    Match {
        #[serde(flatten)]
        stored: &'a StoredMatch,
    },
    Pattern {
        #[serde(flatten)]
        pattern: &'a DetectedPattern,
    },
}

pub struct StructuredLogger;

impl StructuredLogger {
    /// Install the global subscriber. Level comes from RUST_LOG, else
    /// `default_level`. Logs go to stderr; stdout is reserved for results.
    pub fn init(json: bool, default_level: &str) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let registry = tracing_subscriber::registry().with(filter);
        let result = if json {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_span_events(FmtSpan::NONE)
                        .with_writer(io::stderr),
                )
                .try_init()
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
        };
        if let Err(e) = result {
            eprintln!("logging already initialized: {}", e);
        }
    }

    /// Write one serialized line.
    pub fn emit_json(line: &impl Serialize, w: &mut impl Write) -> io::Result<()> {
        let encoded = serde_json::to_string(line)?;
        writeln!(w, "{}", encoded)
    }
}
