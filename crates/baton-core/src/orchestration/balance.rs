//! Credit gate run before any delegation.
//!
//! Balance is read, then topped up at most once, with no cross-process lock.
//! Two fan-outs against one plan can both see a shortfall and both order;
//! that is accepted because an order only ever adds credit.

use crate::error::BatonError;
use crate::models::Step;
use crate::orchestration::Collaborators;

#[derive(Clone)]
pub struct BalanceGuard {
    deps: Collaborators,
}

impl BalanceGuard {
    pub fn new(deps: Collaborators) -> Self {
        Self { deps }
    }

    /// Make sure `plan_id` can pay for `required` delegations on behalf of `step`.
    ///
    /// `Ok(false)` means the step has already been written as `Failed`; the
    /// caller must not touch it again. Read and order faults propagate.
    pub async fn ensure_balance(
        &self,
        plan_id: &str,
        step: &Step,
        required: u64,
    ) -> Result<bool, BatonError> {
        let balance = self.deps.plans.get_plan_balance(plan_id).await?;
        if balance >= required {
            self.deps
                .log
                .debug(
                    &step.task_id,
                    format!("Plan {} has {} credits ({} required)", plan_id, balance, required),
                )
                .await;
            return Ok(true);
        }

        self.deps
            .log
            .warning(
                &step.task_id,
                format!(
                    "Plan {} has {} credits but step {} needs {}; ordering a top-up",
                    plan_id, balance, step.step_id, required
                ),
            )
            .await;

        if self.deps.plans.order_plan(plan_id).await? {
            self.deps
                .log
                .info(&step.task_id, format!("Topped up plan {}", plan_id))
                .await;
            return Ok(true);
        }

        let message = format!(
            "Insufficient balance on plan {}: {} credits available, {} required, and the top-up order failed",
            plan_id, balance, required
        );
        self.deps.log.error(&step.task_id, message.clone()).await;
        self.deps.persist_step(&step.failed(message)).await?;
        Ok(false)
    }
}
