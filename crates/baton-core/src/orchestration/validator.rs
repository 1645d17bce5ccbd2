//! Turns a finished remote task into a result.

use crate::error::BatonError;
use crate::models::{AccessConfig, Artifacts, RemoteTaskStatus, Step};
use crate::orchestration::Collaborators;

const MISSING_OUTPUT: &str = "Error: the agent finished without producing output";

#[derive(Clone)]
pub struct TaskValidator {
    deps: Collaborators,
}

impl TaskValidator {
    pub fn new(deps: Collaborators) -> Self {
        Self { deps }
    }

    /// Generic form: the remote task's result is the step's result.
    ///
    /// Writes `step` as `Completed` or `Failed` and returns it as written.
    /// A task that cannot be read is a `Delegation` error and nothing is
    /// written; a fault while writing the step passes through unchanged.
    pub async fn validate_step(
        &self,
        remote_task_id: &str,
        agent_id: &str,
        access: &AccessConfig,
        step: &Step,
    ) -> Result<Step, BatonError> {
        let task = self
            .deps
            .agents
            .get_task_with_steps(agent_id, remote_task_id, access)
            .await
            .map_err(|e| {
                BatonError::delegation(
                    agent_id,
                    format!("cannot read remote task {}: {}", remote_task_id, e),
                )
            })?;

        let output = task.output.clone().unwrap_or_else(|| MISSING_OUTPUT.to_string());
        let resolved = if task.task_status == RemoteTaskStatus::Completed {
            step.completed(output, task.output_artifacts.clone())
        } else {
            self.deps
                .log
                .error(
                    &step.task_id,
                    format!(
                        "Remote task {} on agent {} ended {}",
                        remote_task_id, agent_id, task.task_status
                    ),
                )
                .await;
            step.failed(output)
        };

        self.deps.persist_step(&resolved).await?;
        Ok(resolved)
    }

    /// Artifact-only form used by fan-out children. Never touches a step:
    /// the join decides when the parent resolves.
    pub async fn validate_artifacts(
        &self,
        remote_task_id: &str,
        agent_id: &str,
        access: &AccessConfig,
    ) -> Result<Artifacts, BatonError> {
        let task = self
            .deps
            .agents
            .get_task_with_steps(agent_id, remote_task_id, access)
            .await?;

        if task.task_status != RemoteTaskStatus::Completed {
            return Err(BatonError::Validation(format!(
                "remote task {} on agent {} ended {}: {}",
                remote_task_id,
                agent_id,
                task.task_status,
                task.output.as_deref().unwrap_or("no output")
            )));
        }
        Ok(task.output_artifacts)
    }
}
