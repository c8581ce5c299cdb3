//! AML risk engine CLI: seed the local store, assess entities, inspect the
//! audit trail and scan transaction batches. Results are ndjson on stdout.

use aml_risk_engine::{
    config::{BackendKind, EngineConfig},
    entity::{EntityRecord, EntitySource, EntityType, Transaction},
    logging::{OutputLine, StructuredLogger},
    patterns::PatternDetector,
    remote::RestBackend,
    risk::{MatchStore, RiskEngine},
    rules::{CategoryFilter, Rule, RuleSource},
    storage::SecureStore,
};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const PLACEHOLDER_SECRET: &str = "aml-store-secret-placeholder";

#[derive(Parser)]
#[command(name = "aml-risk-engine", version, about = "Rule-based AML risk scoring and pattern detection")]
struct Cli {
    /// Engine configuration (JSON); defaults apply when missing
    #[arg(long, env = "AML_CONFIG_PATH", default_value = "config.json", global = true)]
    config: PathBuf,

    /// Secret for encrypting the local store
    #[arg(long, env = "AML_STORE_SECRET", hide_env_values = true, global = true)]
    store_secret: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List active rules
    Rules {
        /// Category to filter by; `all` lists every category
        #[arg(long, default_value = "all")]
        category: String,
    },
    /// Load rules from a JSON array into the local store
    ImportRules {
        #[arg(long)]
        input: PathBuf,
    },
    /// Load entity rows from a JSON array into the local store
    ImportEntities {
        #[arg(long)]
        entity_type: EntityType,
        #[arg(long)]
        input: PathBuf,
    },
    /// Assess entities from a file or by id
    Assess(AssessArgs),
    /// Show the audit trail and the reloaded assessment of one entity
    Matches {
        #[arg(long)]
        entity_type: EntityType,
        #[arg(long)]
        id: String,
    },
    /// Scan a JSON array of transactions for suspicious patterns
    Patterns {
        #[arg(long)]
        input: PathBuf,
    },
}

#[derive(Args)]
struct AssessArgs {
    #[arg(long)]
    entity_type: EntityType,
    /// JSON array of entity rows (or one row)
    #[arg(long, conflicts_with = "id", required_unless_present = "id")]
    input: Option<PathBuf>,
    /// Fetch this entity from the configured backend
    #[arg(long)]
    id: Option<String>,
}

/// Backend handles, each behind the boundary trait the engine consumes.
struct Backend {
    rules: Arc<dyn RuleSource>,
    matches: Arc<dyn MatchStore>,
    entities: Arc<dyn EntitySource>,
}

impl Backend {
    fn over<S>(store: Arc<S>) -> Self
    where
        S: RuleSource + MatchStore + EntitySource + 'static,
    {
        Self {
            rules: store.clone(),
            matches: store.clone(),
            entities: store,
        }
    }

    fn engine(&self, config: &EngineConfig) -> RiskEngine {
        RiskEngine::new(config.risk.clone(), self.rules.clone(), self.matches.clone())
            .with_entity_source(self.entities.clone())
    }
}

fn open_local(config: &EngineConfig, secret: Option<&str>) -> Result<SecureStore, BoxError> {
    std::fs::create_dir_all(&config.data_dir)?;
    let secret = match secret {
        Some(s) if !s.is_empty() => s,
        _ => {
            warn!("AML_STORE_SECRET not set; using placeholder secret");
            PLACEHOLDER_SECRET
        }
    };
    Ok(SecureStore::open(&config.sqlite_path(), secret.as_bytes())?)
}

fn open_backend(config: &EngineConfig, secret: Option<&str>) -> Result<Backend, BoxError> {
    match config.store.backend {
        BackendKind::Sqlite => Ok(Backend::over(Arc::new(open_local(config, secret)?))),
        BackendKind::Rest => Ok(Backend::over(Arc::new(RestBackend::new(&config.store.rest)?))),
    }
}

fn read_json_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, BoxError> {
    let data = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&data)?;
    let rows = match value {
        serde_json::Value::Array(rows) => rows,
        single => vec![single],
    };
    rows.into_iter()
        .map(|r| serde_json::from_value(r).map_err(BoxError::from))
        .collect()
}

fn emit(out: &mut impl Write, line: &OutputLine<'_>) -> Result<(), BoxError> {
    StructuredLogger::emit_json(line, out)?;
    Ok(())
}

async fn assess(
    config: &EngineConfig,
    backend: &Backend,
    args: AssessArgs,
    out: &mut impl Write,
) -> Result<(), BoxError> {
    let engine = Arc::new(backend.engine(config));
    let entity_type = args.entity_type;

    // Rows that fail to parse are reported in place; the rest are assessed concurrently.
    let mut tasks = JoinSet::new();
    let mut rejected: Vec<Option<(String, String)>> = Vec::new();
    match (args.input, args.id) {
        (Some(path), _) => {
            for (idx, row) in read_json_rows::<serde_json::Value>(&path)?.into_iter().enumerate() {
                let label = row
                    .get("id")
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .unwrap_or_default();
                rejected.push(None);
                match EntityRecord::from_json(entity_type, row) {
                    Ok(entity) => {
                        let engine = engine.clone();
                        tasks.spawn(async move {
                            let res = engine.evaluate_entity_risk(&entity).await;
                            (idx, entity.id, res)
                        });
                    }
                    Err(e) => rejected[idx] = Some((label, e.to_string())),
                }
            }
        }
        (None, Some(id)) => {
            rejected.push(None);
            let engine = engine.clone();
            tasks.spawn(async move {
                let res = engine.assess_entity(&id, entity_type).await;
                (0, id, res)
            });
        }
        (None, None) => return Err("either --input or --id is required".into()),
    }

    let mut results = Vec::with_capacity(rejected.len());
    results.resize_with(rejected.len(), || None);
    while let Some(joined) = tasks.join_next().await {
        let (idx, id, res) = joined?;
        results[idx] = Some((id, res));
    }

    let total = rejected.len();
    let mut failed = 0usize;
    for (rejection, result) in rejected.into_iter().zip(results) {
        match (rejection, result) {
            (_, Some((_, Ok(result)))) => emit(out, &OutputLine::Assessment { result: &result })?,
            (_, Some((id, Err(e)))) => {
                failed += 1;
                error!(entity_id = %id, error = %e, "assessment failed");
                emit(
                    out,
                    &OutputLine::Failure {
                        entity_id: &id,
                        entity_type,
                        error: e.to_string(),
                        partial: e.partial_result(),
                    },
                )?;
            }
            (Some((id, reason)), None) => {
                failed += 1;
                error!(entity_id = %id, error = %reason, "invalid entity row");
                emit(
                    out,
                    &OutputLine::Failure {
                        entity_id: &id,
                        entity_type,
                        error: reason,
                        partial: None,
                    },
                )?;
            }
            _ => {}
        }
    }
    info!(total, failed, "assessment batch complete");
    if failed > 0 {
        return Err(format!("{} of {} entities not fully assessed", failed, total).into());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let config = EngineConfig::load(&cli.config);
    StructuredLogger::init(config.log.json, &config.log.level);
    config.risk.validate()?;
    config.patterns.validate()?;
    info!(config = ?cli.config, backend = ?config.store.backend, "aml risk engine starting");

    let secret = cli.store_secret.as_deref();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Command::Rules { category } => {
            let backend = open_backend(&config, secret)?;
            let rules = backend
                .engine(&config)
                .get_rules_by_category(CategoryFilter::from(category.as_str()))
                .await?;
            for rule in &rules {
                StructuredLogger::emit_json(rule, &mut out)?;
            }
        }
        Command::ImportRules { input } => {
            let store = open_local(&config, secret)?;
            let rules: Vec<Rule> = read_json_rows(&input)?;
            for rule in &rules {
                rule.validate()?;
                store.upsert_rule(rule)?;
            }
            info!(count = rules.len(), "rules imported");
        }
        Command::ImportEntities { entity_type, input } => {
            let store = open_local(&config, secret)?;
            let rows: Vec<serde_json::Value> = read_json_rows(&input)?;
            let count = rows.len();
            for row in rows {
                store.insert_entity(&EntityRecord::from_json(entity_type, row)?)?;
            }
            info!(count, %entity_type, "entities imported");
        }
        Command::Assess(args) => {
            let backend = open_backend(&config, secret)?;
            assess(&config, &backend, args, &mut out).await?;
        }
        Command::Matches { entity_type, id } => {
            let backend = open_backend(&config, secret)?;
            for stored in backend.matches.list_matches(&id, entity_type).await? {
                emit(&mut out, &OutputLine::Match { stored: &stored })?;
            }
            let result = backend
                .engine(&config)
                .load_existing_matches(&id, entity_type)
                .await?;
            emit(&mut out, &OutputLine::Assessment { result: &result })?;
        }
        Command::Patterns { input } => {
            let transactions: Vec<Transaction> = read_json_rows(&input)?;
            let detector = PatternDetector::new(config.patterns.clone());
            for pattern in detector.detect(&transactions)? {
                emit(&mut out, &OutputLine::Pattern { pattern: &pattern })?;
            }
        }
    }
    out.flush()?;
    Ok(())
}
