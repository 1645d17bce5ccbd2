//! Runtime configuration.
//!
//! Loaded from a YAML file (default `baton.yaml`) whose values may reference
//! the environment with `${VAR}` or `${VAR:-default}`. The CLI layers its own
//! flags and environment variables on top.
//!
//! ```yaml
//! ledger:
//!   base_url: "${BATON_LEDGER_URL:-http://localhost:3000}"
//!   api_key: "${BATON_API_KEY}"
//!   agent_id: "${BATON_AGENT_ID}"
//!   poll_interval_ms: 2000
//! store:
//!   backend: sqlite
//!   db_path: "baton.db"
//! workflow_file: "workflows/video.yaml"
//! delegation_timeout_secs: 1800
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BatonError;
use crate::orchestration::delegator::DEFAULT_DELEGATION_TIMEOUT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatonConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Workflow definition the dispatcher serves.
    #[serde(default)]
    pub workflow_file: Option<String>,
    /// How long one delegation may wait for a terminal notification.
    #[serde(default = "default_delegation_timeout")]
    pub delegation_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// The agent this orchestrator runs as; its room is joined on subscribe
    /// and its steps are the ones dispatched.
    #[serde(default)]
    pub agent_id: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Steps live on the remote ledger.
    #[default]
    Remote,
    /// Steps live in a local SQLite database.
    Sqlite,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "remote" => Ok(Self::Remote),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("Unknown store backend '{}'. Use remote or sqlite.", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_delegation_timeout() -> u64 {
    DEFAULT_DELEGATION_TIMEOUT.as_secs()
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    60
}

fn default_db_path() -> String {
    "baton.db".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            agent_id: String::new(),
            poll_interval_ms: default_poll_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            db_path: default_db_path(),
        }
    }
}

impl Default for BatonConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            store: StoreConfig::default(),
            workflow_file: None,
            delegation_timeout_secs: default_delegation_timeout(),
        }
    }
}

impl BatonConfig {
    /// Parse a config from YAML, resolving `${VAR}` references first.
    pub fn from_yaml(yaml: &str) -> Result<Self, BatonError> {
        serde_yaml::from_str(&resolve_env_vars(yaml))
            .map_err(|e| BatonError::Config(format!("Failed to parse config YAML: {}", e)))
    }

    pub fn from_file(path: &str) -> Result<Self, BatonError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BatonError::Config(format!("Failed to read config file '{}': {}", path, e)))?;
        Self::from_yaml(&content)
    }

    pub fn delegation_timeout(&self) -> Duration {
        Duration::from_secs(self.delegation_timeout_secs)
    }

    /// Check the settings a remote-backed run cannot do without.
    pub fn validate_remote(&self) -> Result<(), BatonError> {
        if self.ledger.api_key.is_empty() {
            return Err(BatonError::Config(
                "No ledger API key. Set BATON_API_KEY or ledger.api_key.".to_string(),
            ));
        }
        if self.ledger.agent_id.is_empty() {
            return Err(BatonError::Config(
                "No agent id. Set BATON_AGENT_ID or ledger.agent_id.".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax; unknown variables
/// without a default are left as written.
pub fn resolve_env_vars(input: &str) -> String {
    let re = env_var_regex();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_expr = &caps[1];
        if let Some(idx) = var_expr.find(":-") {
            let var_name = &var_expr[..idx];
            let default_val = &var_expr[idx + 2..];
            std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
        } else {
            std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
        }
    })
    .to_string()
}

fn env_var_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*(?::-[^}]*)?)\}").expect("valid regex"))
}
