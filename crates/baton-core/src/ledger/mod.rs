//! Collaborator seams for the external task/payment ledger.
//!
//! The orchestration core never talks to a transport directly; it consumes
//! these traits. [`http::HttpLedger`] is the REST adapter used by the binary,
//! tests substitute in-memory fakes.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BatonError;
use crate::models::{AccessConfig, RemoteTask, StepEvent, TaskRequest};
use crate::store::StoreResponse;

pub use http::HttpLedger;

/// Where a ledger pushes raw status-change payloads for one remote task.
/// The receiving side is dropped once the task resolves; adapters should
/// stop delivering when `send` fails.
pub type NotificationSink = mpsc::UnboundedSender<serde_json::Value>;

/// Event stream handed out by [`EventSource::subscribe`].
pub type StepEventStream = mpsc::Receiver<StepEvent>;

#[async_trait]
pub trait AgentLedger: Send + Sync {
    /// Fresh access capability for delegating to `agent_id` under `plan_id`.
    async fn get_service_access_config(
        &self,
        plan_id: &str,
        agent_id: &str,
    ) -> Result<AccessConfig, BatonError>;

    /// Create a remote task and register `sink` for its status changes.
    async fn create_task(
        &self,
        agent_id: &str,
        request: &TaskRequest,
        access: &AccessConfig,
        sink: NotificationSink,
    ) -> Result<StoreResponse, BatonError>;

    /// Full remote task record, including the agent's own internal steps.
    async fn get_task_with_steps(
        &self,
        agent_id: &str,
        task_id: &str,
        access: &AccessConfig,
    ) -> Result<RemoteTask, BatonError>;
}

#[async_trait]
pub trait PlanLedger: Send + Sync {
    async fn get_plan_balance(&self, plan_id: &str) -> Result<u64, BatonError>;

    /// Buy more credit. `Ok(false)` means the ledger refused the order.
    async fn order_plan(&self, plan_id: &str) -> Result<bool, BatonError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeOptions {
    #[serde(default)]
    pub join_agent_rooms: Vec<String>,
    #[serde(default)]
    pub subscribe_event_types: Vec<String>,
    /// Replay events that were emitted while nobody was listening.
    #[serde(default)]
    pub get_pending_events_on_subscribe: bool,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, options: SubscribeOptions) -> Result<StepEventStream, BatonError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Debug,
    Error,
}

/// One audit entry attached to a workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub task_id: String,
    pub level: LogLevel,
    pub message: String,
}

/// Audit log attached to a workflow instance on the ledger.
#[async_trait]
pub trait TaskLog: Send + Sync {
    async fn log_task(&self, entry: &TaskLogEntry) -> Result<(), BatonError>;
}
