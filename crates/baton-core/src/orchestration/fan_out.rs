//! Fan-out/join: N concurrent delegations for one step, resolved all-or-nothing.
//!
//! The credit check is sized to the whole batch and happens before anything
//! starts. Every branch is awaited (all-settle, not first-to-finish). One
//! failing branch fails the step and the successful results are discarded;
//! there is no per-item retry.

use futures::future::join_all;

use crate::error::BatonError;
use crate::models::{Artifacts, Step};
use crate::orchestration::{BalanceGuard, Collaborators, Delegator};
use crate::workflow::StepDefinition;

#[derive(Clone)]
pub struct FanOutCoordinator {
    deps: Collaborators,
    guard: BalanceGuard,
    delegator: Delegator,
}

impl FanOutCoordinator {
    pub fn new(deps: Collaborators, guard: BalanceGuard, delegator: Delegator) -> Self {
        Self {
            deps,
            guard,
            delegator,
        }
    }

    /// Run one delegation per item and resolve `step` from the joined result.
    ///
    /// Returns the step as written, or `None` if the balance guard already
    /// failed it.
    pub async fn run_fan_out<F>(
        &self,
        target: &StepDefinition,
        step: &Step,
        items: &[String],
        prompt_fn: F,
    ) -> Result<Option<Step>, BatonError>
    where
        F: Fn(&str) -> String,
    {
        if items.is_empty() {
            let done = step.completed("No items to process", Artifacts::Empty);
            self.deps.persist_step(&done).await?;
            return Ok(Some(done));
        }

        let width = items.len() as u64;
        if !self.guard.ensure_balance(&target.plan, step, width).await? {
            return Ok(None);
        }

        self.deps
            .log
            .info(
                &step.task_id,
                format!(
                    "[FanOut] Step {} starting {} delegations to agent {}",
                    step.step_id,
                    items.len(),
                    target.agent
                ),
            )
            .await;

        let prompts: Vec<String> = items.iter().map(|item| prompt_fn(item)).collect();
        let branches = prompts
            .iter()
            .map(|prompt| self.delegator.delegate_artifacts(target, prompt, &step.task_id));
        let settled = join_all(branches).await;

        let total = settled.len();
        let mut collected = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (index, outcome) in settled.into_iter().enumerate() {
            match outcome {
                Ok(artifacts) => collected.push(artifacts),
                Err(e) => failures.push(format!("item {}: {}", index, e)),
            }
        }

        let resolved = if failures.is_empty() {
            let artifacts = Artifacts::concat(collected);
            self.deps
                .log
                .info(
                    &step.task_id,
                    format!(
                        "[FanOut] Step {} joined {} results ({} artifacts)",
                        step.step_id,
                        total,
                        artifacts.len()
                    ),
                )
                .await;
            step.completed(format!("Completed {} sub-tasks", total), artifacts)
        } else {
            let message = format!(
                "{} of {} sub-tasks failed: {}",
                failures.len(),
                total,
                failures.join("; ")
            );
            self.deps.log.error(&step.task_id, message.clone()).await;
            step.failed(message)
        };

        self.deps.persist_step(&resolved).await?;
        Ok(Some(resolved))
    }
}
