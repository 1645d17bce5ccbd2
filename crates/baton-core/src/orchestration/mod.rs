//! Orchestration core — turns step-change notifications into gated,
//! correctly ordered workflow progress.
//!
//! Flow for one event:
//!   1. `Dispatcher` re-reads the step and drops anything not `Pending`
//!   2. routes by step name through the `HandlerRegistry`
//!   3. `init` → `Initializer` mints the successor chain
//!   4. `delegate` → `BalanceGuard`, then one `Delegator` run validated by
//!      the generic `TaskValidator` (which resolves the step)
//!   5. `fan_out` → `FanOutCoordinator`: one up-front guard check, N
//!      concurrent delegations, all-or-nothing join
//!
//! Handlers own every status write. There is no in-process shared state
//! between steps; the step store is the only synchronization point.

pub mod balance;
pub mod delegator;
pub mod dispatcher;
pub mod fan_out;
pub mod initializer;
pub mod validator;

use std::sync::Arc;

use crate::error::BatonError;
use crate::ledger::{AgentLedger, PlanLedger};
use crate::logging::TaskLogger;
use crate::models::Step;
use crate::store::StepStore;

pub use balance::BalanceGuard;
pub use delegator::Delegator;
pub use dispatcher::Dispatcher;
pub use fan_out::FanOutCoordinator;
pub use initializer::{build_chain, Initializer};
pub use validator::TaskValidator;

/// External collaborators shared by every component.
#[derive(Clone)]
pub struct Collaborators {
    pub steps: Arc<dyn StepStore>,
    pub agents: Arc<dyn AgentLedger>,
    pub plans: Arc<dyn PlanLedger>,
    pub log: TaskLogger,
}

impl Collaborators {
    /// Write a step back to the store.
    ///
    /// Returns whether the store accepted it; a rejection is logged with the
    /// store's payload verbatim and is not an error.
    pub async fn persist_step(&self, step: &Step) -> Result<bool, BatonError> {
        let resp = self.steps.update_step(step).await?;
        if resp.is_accepted() {
            self.log
                .info(
                    &step.task_id,
                    format!("Step {} ({}) is now {}", step.step_id, step.name, step.status),
                )
                .await;
            Ok(true)
        } else {
            self.log
                .error(
                    &step.task_id,
                    format!(
                        "Store rejected update of step {} ({}): status {}, {}",
                        step.step_id,
                        step.name,
                        resp.status,
                        resp.data_text()
                    ),
                )
                .await;
            Ok(false)
        }
    }
}
