use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::artifacts::Artifacts;

/// Status of a delegated task. Agents may report any intermediate value;
/// only `Completed` and `Failed` mean anything to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RemoteTaskStatus {
    Pending,
    Completed,
    Failed,
    Other(String),
}

impl RemoteTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for RemoteTaskStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Pending" | "PENDING" => Self::Pending,
            "Completed" | "COMPLETED" => Self::Completed,
            "Failed" | "FAILED" => Self::Failed,
            _ => Self::Other(s),
        }
    }
}

impl From<RemoteTaskStatus> for String {
    fn from(s: RemoteTaskStatus) -> Self {
        s.as_str().to_string()
    }
}

impl std::fmt::Display for RemoteTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work delegated to an external agent, as reported by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTask {
    pub task_id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub query: String,
    pub task_status: RemoteTaskStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub output_artifacts: Artifacts,
    /// The agent's own internal steps; opaque to the core.
    #[serde(default)]
    pub steps: Vec<Value>,
}

/// Body of a task creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub query: String,
    pub name: String,
    #[serde(default)]
    pub additional_params: Vec<Value>,
    #[serde(default)]
    pub artifacts: Vec<Value>,
}

impl TaskRequest {
    pub fn new(query: &str, name: &str) -> Self {
        Self {
            query: query.to_string(),
            name: name.to_string(),
            additional_params: Vec::new(),
            artifacts: Vec::new(),
        }
    }
}

/// A status-change notification for a remote task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNotification {
    pub task_id: String,
    pub task_status: RemoteTaskStatus,
}

impl TaskNotification {
    /// Parse a raw notification payload. Adapters deliver either a JSON
    /// object or a JSON string holding one.
    pub fn parse(raw: &Value) -> Result<Self, serde_json::Error> {
        match raw {
            Value::String(s) => serde_json::from_str(s),
            other => serde_json::from_value(other.clone()),
        }
    }
}
