//! Step storage.
//!
//! The step store is the single source of truth for workflow progress and the
//! only synchronization point between concurrently running handlers. It is
//! also what enforces ordering: a successor only becomes `Pending` once its
//! predecessor is terminal.

pub mod step_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BatonError;
use crate::models::Step;

pub use step_store::SqliteStepStore;

/// Status code a store returns when it accepted a write.
pub const STATUS_ACCEPTED: u16 = 201;

/// Raw store reply. Non-accepted replies are not errors at the Rust level:
/// the handler decides what they mean for the step, and `data` is logged
/// verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResponse {
    pub status: u16,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl StoreResponse {
    pub fn accepted(data: serde_json::Value) -> Self {
        Self {
            status: STATUS_ACCEPTED,
            data,
        }
    }

    pub fn rejected(status: u16, data: serde_json::Value) -> Self {
        Self { status, data }
    }

    /// Whether a step update was accepted.
    pub fn is_accepted(&self) -> bool {
        self.status == STATUS_ACCEPTED
    }

    /// Whether a creation request succeeded (any 2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Store payload as text, for echoing into a step's `output`.
    pub fn data_text(&self) -> String {
        match &self.data {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
pub trait StepStore: Send + Sync {
    async fn get_step(&self, step_id: &str) -> Result<Step, BatonError>;

    /// Create all `steps` for workflow instance `task_id` in one atomic request.
    async fn create_steps(&self, task_id: &str, steps: Vec<Step>) -> Result<StoreResponse, BatonError>;

    async fn update_step(&self, step: &Step) -> Result<StoreResponse, BatonError>;
}
