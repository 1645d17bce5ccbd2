//! Delegates one piece of work to one agent and waits for it to finish.
//!
//! The ledger pushes raw status payloads into a channel. The delegator reads
//! that channel until the first terminal status, then stops reading and drops
//! the receiver, so a delegation resolves exactly once no matter how many
//! notifications follow. Progress notifications are only logged.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::BatonError;
use crate::models::{AccessConfig, Artifacts, Step, TaskNotification, TaskRequest};
use crate::orchestration::{Collaborators, TaskValidator};
use crate::workflow::StepDefinition;

/// Default upper bound on how long a delegation may stay unresolved.
pub const DEFAULT_DELEGATION_TIMEOUT: Duration = Duration::from_secs(1800);

#[derive(Clone)]
pub struct Delegator {
    deps: Collaborators,
    validator: TaskValidator,
    timeout: Duration,
}

/// A remote task that reached a terminal state.
struct Finished {
    remote_task_id: String,
    access: AccessConfig,
}

impl Delegator {
    pub fn new(deps: Collaborators, validator: TaskValidator, timeout: Duration) -> Self {
        Self {
            deps,
            validator,
            timeout,
        }
    }

    /// Delegate on behalf of `step` and let the generic validator resolve it.
    ///
    /// A `Delegation` or `Timeout` error means the step has NOT been written;
    /// the caller owns that. Store faults while writing the result are
    /// returned as they are.
    pub async fn delegate_step(
        &self,
        target: &StepDefinition,
        query: &str,
        step: &Step,
    ) -> Result<Step, BatonError> {
        let finished = self.run(target, query, &step.task_id).await?;
        self.validator
            .validate_step(&finished.remote_task_id, &target.agent, &finished.access, step)
            .await
    }

    /// Delegate and return only the produced artifacts.
    pub async fn delegate_artifacts(
        &self,
        target: &StepDefinition,
        query: &str,
        task_id: &str,
    ) -> Result<Artifacts, BatonError> {
        let finished = self.run(target, query, task_id).await?;
        self.validator
            .validate_artifacts(&finished.remote_task_id, &target.agent, &finished.access)
            .await
            .map_err(|e| BatonError::delegation(&target.agent, e.to_string()))
    }

    async fn run(
        &self,
        target: &StepDefinition,
        query: &str,
        task_id: &str,
    ) -> Result<Finished, BatonError> {
        let agent_id = target.agent.as_str();
        let access = self
            .deps
            .agents
            .get_service_access_config(&target.plan, agent_id)
            .await
            .map_err(|e| BatonError::delegation(agent_id, format!("no access config: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let request = TaskRequest::new(query, target.remote_task_name());
        let resp = self
            .deps
            .agents
            .create_task(agent_id, &request, &access, tx)
            .await
            .map_err(|e| BatonError::delegation(agent_id, e.to_string()))?;

        if !resp.is_success() {
            return Err(BatonError::delegation(
                agent_id,
                format!("task creation rejected (status {}): {}", resp.status, resp.data_text()),
            ));
        }

        let created_id = created_task_id(&resp.data);
        self.deps
            .log
            .info(
                task_id,
                format!(
                    "[Delegator] Created remote task {} on agent {}",
                    created_id.as_deref().unwrap_or("<unknown>"),
                    agent_id
                ),
            )
            .await;

        match tokio::time::timeout(
            self.timeout,
            self.await_terminal(agent_id, task_id, created_id.as_deref(), rx),
        )
        .await
        {
            Ok(Ok(remote_task_id)) => Ok(Finished {
                remote_task_id,
                access,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BatonError::Timeout(format!(
                "remote task {} on agent {} did not finish within {}s",
                created_id.as_deref().unwrap_or("<unknown>"),
                agent_id,
                self.timeout.as_secs()
            ))),
        }
    }

    /// Read notifications until the first terminal one; returns its task id.
    async fn await_terminal(
        &self,
        agent_id: &str,
        task_id: &str,
        created_id: Option<&str>,
        mut rx: mpsc::UnboundedReceiver<serde_json::Value>,
    ) -> Result<String, BatonError> {
        while let Some(raw) = rx.recv().await {
            let notification = TaskNotification::parse(&raw).map_err(|e| {
                BatonError::delegation(agent_id, format!("malformed notification: {}", e))
            })?;

            if let Some(expected) = created_id {
                if notification.task_id != expected {
                    tracing::debug!(
                        "[Delegator] Ignoring notification for task {} (waiting on {})",
                        notification.task_id,
                        expected
                    );
                    continue;
                }
            }

            if !notification.task_status.is_terminal() {
                self.deps
                    .log
                    .debug(
                        task_id,
                        format!(
                            "[Delegator] Remote task {} on agent {} is {}",
                            notification.task_id, agent_id, notification.task_status
                        ),
                    )
                    .await;
                continue;
            }

            return Ok(notification.task_id);
        }

        Err(BatonError::delegation(
            agent_id,
            "notification channel closed before the task finished",
        ))
    }
}

fn created_task_id(data: &serde_json::Value) -> Option<String> {
    ["/task/task_id", "/task_id", "/task/id"]
        .iter()
        .find_map(|p| data.pointer(p))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
