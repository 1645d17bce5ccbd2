//! Expands a workflow definition into its chain of concrete steps.

use crate::error::BatonError;
use crate::models::{Step, StepStatus};
use crate::orchestration::Collaborators;
use crate::workflow::WorkflowDefinition;

#[derive(Clone)]
pub struct Initializer {
    deps: Collaborators,
    workflow: WorkflowDefinition,
}

/// Successor steps for `trigger`, in order.
///
/// Each step points at the previous step's freshly minted id (the first at
/// the trigger itself) and starts `Not Ready`; the store activates them one
/// at a time. Only the final step is flagged `is_last`.
pub fn build_chain(trigger: &Step, workflow: &WorkflowDefinition) -> Vec<Step> {
    let mut chain: Vec<Step> = Vec::with_capacity(workflow.steps.len());
    let mut predecessor = trigger.step_id.clone();

    for def in &workflow.steps {
        let mut step = Step::new(
            &trigger.task_id,
            &def.name,
            Some(predecessor.clone()),
            StepStatus::NotReady,
        );
        step.input_query = trigger.input_query.clone();
        predecessor = step.step_id.clone();
        chain.push(step);
    }

    if let Some(last) = chain.last_mut() {
        last.is_last = true;
    }
    chain
}

impl Initializer {
    pub fn new(deps: Collaborators, workflow: WorkflowDefinition) -> Self {
        Self { deps, workflow }
    }

    /// Create the successor chain and resolve the trigger step.
    ///
    /// The trigger completes once the chain exists, whatever later happens to
    /// the successors; it fails only when the store refuses the chain.
    pub async fn initialize(&self, trigger: &Step) -> Result<Step, BatonError> {
        let chain = build_chain(trigger, &self.workflow);
        let count = chain.len();

        let outcome = self.deps.steps.create_steps(&trigger.task_id, chain).await;
        let resolved = match outcome {
            Ok(resp) if resp.is_success() => {
                self.deps
                    .log
                    .info(
                        &trigger.task_id,
                        format!(
                            "[Initializer] Created {} steps for workflow '{}'",
                            count, self.workflow.name
                        ),
                    )
                    .await;
                trigger.completed(trigger.input_query.clone(), trigger.input_artifacts.clone())
            }
            Ok(resp) => {
                self.deps
                    .log
                    .error(
                        &trigger.task_id,
                        format!(
                            "[Initializer] Store refused the step chain (status {}): {}",
                            resp.status,
                            resp.data_text()
                        ),
                    )
                    .await;
                trigger.failed(resp.data_text())
            }
            Err(e) => {
                self.deps
                    .log
                    .error(&trigger.task_id, format!("[Initializer] Failed to create steps: {}", e))
                    .await;
                trigger.failed(e.to_string())
            }
        };

        self.deps.persist_step(&resolved).await?;
        Ok(resolved)
    }
}
