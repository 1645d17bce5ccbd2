//! Core error type for Baton.
//!
//! `BatonError` is used throughout the core (stores, ledger adapters,
//! orchestration). Failures that belong to a specific step are written to
//! that step instead of being returned; what surfaces here is what happened
//! before a step context existed, or what a handler could not recover from.

#[derive(Debug, thiserror::Error)]
pub enum BatonError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Delegation to agent {agent_id} failed: {message}")]
    Delegation { agent_id: String, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BatonError {
    pub fn delegation(agent_id: &str, message: impl Into<String>) -> Self {
        Self::Delegation {
            agent_id: agent_id.to_string(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for BatonError {
    fn from(e: reqwest::Error) -> Self {
        Self::Ledger(e.to_string())
    }
}

impl From<serde_json::Error> for BatonError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(e.to_string())
    }
}
