//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command. They share one
//! [`Runtime`], which wires the baton-core collaborators for the configured
//! step store backend.

pub mod dispatch;
pub mod run;
pub mod step;
pub mod workflow;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use baton_core::config::{StoreBackend, BatonConfig};
use baton_core::ledger::{EventSource, HttpLedger};
use baton_core::store::SqliteStepStore;
use baton_core::{Collaborators, Database, HandlerRegistry, TaskLogger, WorkflowDefinition};

/// Values given on the command line or through `BATON_*` variables. Each one
/// that is set wins over the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub ledger_url: Option<String>,
    pub api_key: Option<String>,
    pub agent_id: Option<String>,
    pub store: Option<StoreBackend>,
    pub db_path: Option<String>,
    pub workflow_file: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub delegation_timeout_secs: Option<u64>,
}

/// Load the config file (if any) and apply overrides on top.
///
/// An explicitly named file must exist. Without one, `./baton.yaml` and then
/// `<config dir>/baton/baton.yaml` are tried before falling back to defaults.
pub fn load_config(path: Option<&str>, overrides: &Overrides) -> Result<BatonConfig, String> {
    let mut config = match path {
        Some(p) => BatonConfig::from_file(p).map_err(|e| e.to_string())?,
        None => match default_config_path() {
            Some(p) => {
                tracing::info!("[Config] Using {}", p.display());
                BatonConfig::from_file(&p.to_string_lossy()).map_err(|e| e.to_string())?
            }
            None => BatonConfig::default(),
        },
    };

    if let Some(v) = &overrides.ledger_url {
        config.ledger.base_url = v.clone();
    }
    if let Some(v) = &overrides.api_key {
        config.ledger.api_key = v.clone();
    }
    if let Some(v) = &overrides.agent_id {
        config.ledger.agent_id = v.clone();
    }
    if let Some(v) = overrides.store {
        config.store.backend = v;
    }
    if let Some(v) = &overrides.db_path {
        config.store.db_path = v.clone();
    }
    if let Some(v) = &overrides.workflow_file {
        config.workflow_file = Some(v.clone());
    }
    if let Some(v) = overrides.poll_interval_ms {
        config.ledger.poll_interval_ms = v;
    }
    if let Some(v) = overrides.delegation_timeout_secs {
        config.delegation_timeout_secs = v;
    }
    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from("baton.yaml");
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|d| d.join("baton").join("baton.yaml"))
        .filter(|p| p.exists())
}

/// Collaborators wired for one CLI invocation.
pub struct Runtime {
    pub deps: Collaborators,
    pub events: Arc<dyn EventSource>,
    /// Present when steps live in the local database.
    pub local: Option<SqliteStepStore>,
}

impl Runtime {
    pub fn local_store(&self) -> Result<&SqliteStepStore, String> {
        self.local
            .as_ref()
            .ok_or_else(|| "This command needs the sqlite step store (--store sqlite)".to_string())
    }
}

/// Build the runtime for `config`.
///
/// Agents and plans always go through the REST ledger. With the sqlite
/// backend, steps and step events stay local and audit entries only go to
/// the process log.
pub fn init_runtime(config: &BatonConfig) -> Result<Runtime, String> {
    let ledger = Arc::new(HttpLedger::new(&config.ledger).map_err(|e| e.to_string())?);

    match config.store.backend {
        StoreBackend::Remote => {
            config.validate_remote().map_err(|e| e.to_string())?;
            Ok(Runtime {
                deps: Collaborators {
                    steps: ledger.clone(),
                    agents: ledger.clone(),
                    plans: ledger.clone(),
                    log: TaskLogger::new(ledger.clone()),
                },
                events: ledger,
                local: None,
            })
        }
        StoreBackend::Sqlite => {
            let db = Database::open(&config.store.db_path).map_err(|e| {
                format!("Failed to open database '{}': {}", config.store.db_path, e)
            })?;
            let store = SqliteStepStore::new(db);
            Ok(Runtime {
                deps: Collaborators {
                    steps: Arc::new(store.clone()),
                    agents: ledger.clone(),
                    plans: ledger,
                    log: TaskLogger::local(),
                },
                events: Arc::new(store.clone()),
                local: Some(store),
            })
        }
    }
}

/// Load and validate the configured workflow.
pub fn load_registry(config: &BatonConfig) -> Result<HandlerRegistry, String> {
    let file = config
        .workflow_file
        .as_deref()
        .ok_or("No workflow file configured (set workflow_file or --workflow)")?;
    let workflow = WorkflowDefinition::load(file).map_err(|e| e.to_string())?;
    tracing::info!(
        "[Workflow] Loaded '{}' from {} ({} steps)",
        workflow.name,
        file,
        workflow.steps.len()
    );
    Ok(HandlerRegistry::new(workflow))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Load `.env.local` and `.env` into the process environment.
///
/// Runs before argument parsing so `BATON_*` values in these files feed the
/// CLI's env-backed flags. Variables already set are never overwritten.
pub fn load_dotenv() {
    for filename in &[".env.local", ".env"] {
        let path = Path::new(filename);
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        for (key, value) in parse_dotenv(&content) {
            if std::env::var(&key).is_err() {
                std::env::set_var(&key, &value);
            }
        }
    }
}

/// `KEY=VALUE` pairs from a dotenv file; comments, blanks and an optional
/// `export ` prefix are skipped, one layer of matching quotes is stripped.
pub fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim();
            let unquoted = ['"', '\'']
                .iter()
                .find_map(|q| value.strip_prefix(*q)?.strip_suffix(*q))
                .unwrap_or(value);
            Some((key.to_string(), unquoted.to_string()))
        })
        .collect()
}
