//! Audit logging for workflow instances.
//!
//! Every entry goes to `tracing` and to the ledger's per-task audit log, so an
//! operator can follow a workflow from either side. Audit sink failures are
//! reported locally and never fail the caller.

use std::sync::Arc;

use crate::ledger::{LogLevel, TaskLog, TaskLogEntry};

#[derive(Clone)]
pub struct TaskLogger {
    sink: Option<Arc<dyn TaskLog>>,
}

impl TaskLogger {
    pub fn new(sink: Arc<dyn TaskLog>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Logger that only writes to `tracing`.
    pub fn local() -> Self {
        Self { sink: None }
    }

    pub async fn info(&self, task_id: &str, message: impl Into<String>) {
        self.log(task_id, LogLevel::Info, message.into()).await
    }

    pub async fn warning(&self, task_id: &str, message: impl Into<String>) {
        self.log(task_id, LogLevel::Warning, message.into()).await
    }

    pub async fn debug(&self, task_id: &str, message: impl Into<String>) {
        self.log(task_id, LogLevel::Debug, message.into()).await
    }

    pub async fn error(&self, task_id: &str, message: impl Into<String>) {
        self.log(task_id, LogLevel::Error, message.into()).await
    }

    pub async fn log(&self, task_id: &str, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => tracing::info!(task_id = %task_id, "{}", message),
            LogLevel::Warning => tracing::warn!(task_id = %task_id, "{}", message),
            LogLevel::Debug => tracing::debug!(task_id = %task_id, "{}", message),
            LogLevel::Error => tracing::error!(task_id = %task_id, "{}", message),
        }

        let Some(sink) = &self.sink else { return };
        let entry = TaskLogEntry {
            task_id: task_id.to_string(),
            level,
            message,
        };
        if let Err(e) = sink.log_task(&entry).await {
            tracing::warn!("[TaskLogger] Failed to forward audit entry for task {}: {}", task_id, e);
        }
    }
}
