use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::artifacts::Artifacts;

/// Lifecycle of a workflow step as seen by the step store.
///
/// `NotReady` belongs to the store: a successor waits there until its
/// predecessor is terminal. The core only ever acts on `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    #[serde(rename = "Not Ready")]
    NotReady,
    Pending,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotReady => "Not Ready",
            Self::Pending => "Pending",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Not Ready" | "NotReady" | "NOT_READY" => Some(Self::NotReady),
            "Pending" | "PENDING" => Some(Self::Pending),
            "Completed" | "COMPLETED" => Some(Self::Completed),
            "Failed" | "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node in a workflow's linear execution chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    /// Owning workflow instance.
    pub task_id: String,
    /// Selects the handler.
    pub name: String,
    #[serde(default)]
    pub predecessor: Option<String>,
    #[serde(default)]
    pub is_last: bool,
    pub status: StepStatus,
    #[serde(default)]
    pub input_query: String,
    #[serde(default)]
    pub input_artifacts: Artifacts,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub output_artifacts: Artifacts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    /// A fresh step with a newly minted id.
    pub fn new(task_id: &str, name: &str, predecessor: Option<String>, status: StepStatus) -> Self {
        let now = Utc::now();
        Self {
            step_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            name: name.to_string(),
            predecessor,
            is_last: false,
            status,
            input_query: String::new(),
            input_artifacts: Artifacts::Empty,
            output: None,
            output_artifacts: Artifacts::Empty,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy of this step resolved to `Completed`.
    pub fn completed(&self, output: impl Into<String>, artifacts: Artifacts) -> Self {
        let mut s = self.clone();
        s.status = StepStatus::Completed;
        s.output = Some(output.into());
        s.output_artifacts = artifacts;
        s.updated_at = Utc::now();
        s
    }

    /// Copy of this step resolved to `Failed`. Artifacts are left untouched.
    pub fn failed(&self, output: impl Into<String>) -> Self {
        let mut s = self.clone();
        s.status = StepStatus::Failed;
        s.output = Some(output.into());
        s.updated_at = Utc::now();
        s
    }
}

/// A step-change notification. Carries only the reference; the dispatcher
/// always re-reads the full record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvent {
    pub step_id: String,
}

impl StepEvent {
    /// Parse an event as delivered by the subscription, which may be either
    /// a JSON object or a JSON string wrapping one.
    pub fn parse(raw: &serde_json::Value) -> Result<Self, serde_json::Error> {
        match raw {
            serde_json::Value::String(s) => serde_json::from_str(s),
            other => serde_json::from_value(other.clone()),
        }
    }
}
