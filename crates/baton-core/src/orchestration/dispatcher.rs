//! Step-event dispatcher.
//!
//! Receives "step changed" events, re-reads the step from the store, and runs
//! the handler registered for its name. Steps that are not `Pending` are
//! ignored, so events for resolved steps are no-ops. A step that is still
//! `Pending` while its handler runs is not dispatched again by `serve`.
//! Each event is handled on its own task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{self, JoinError, JoinSet};

use crate::error::BatonError;
use crate::ledger::{EventSource, SubscribeOptions};
use crate::models::{Step, StepEvent, StepStatus};
use crate::orchestration::{
    BalanceGuard, Collaborators, Delegator, FanOutCoordinator, Initializer, TaskValidator,
};
use crate::workflow::{render_prompt, Handler, HandlerRegistry, PromptContext, StepDefinition};

#[derive(Clone)]
pub struct Dispatcher {
    deps: Collaborators,
    registry: Arc<HandlerRegistry>,
    initializer: Initializer,
    guard: BalanceGuard,
    delegator: Delegator,
    fan_out: FanOutCoordinator,
}

impl Dispatcher {
    pub fn new(
        deps: Collaborators,
        registry: HandlerRegistry,
        initializer: Initializer,
        guard: BalanceGuard,
        delegator: Delegator,
        fan_out: FanOutCoordinator,
    ) -> Self {
        Self {
            deps,
            registry: Arc::new(registry),
            initializer,
            guard,
            delegator,
            fan_out,
        }
    }

    /// Wire every component from the shared collaborators.
    pub fn from_parts(deps: Collaborators, registry: HandlerRegistry, timeout: Duration) -> Self {
        let guard = BalanceGuard::new(deps.clone());
        let validator = TaskValidator::new(deps.clone());
        let delegator = Delegator::new(deps.clone(), validator, timeout);
        let fan_out = FanOutCoordinator::new(deps.clone(), guard.clone(), delegator.clone());
        let initializer = Initializer::new(deps.clone(), registry.workflow().clone());
        Self::new(deps, registry, initializer, guard, delegator, fan_out)
    }

    /// Handle one step-change event to completion.
    pub async fn dispatch(&self, event: &StepEvent) -> Result<(), BatonError> {
        let step = self.deps.steps.get_step(&event.step_id).await?;

        if step.status != StepStatus::Pending {
            self.deps
                .log
                .warning(
                    &step.task_id,
                    format!(
                        "[Dispatcher] Step {} ({}) is {}, not Pending; skipping",
                        step.step_id, step.name, step.status
                    ),
                )
                .await;
            return Ok(());
        }

        if !self.predecessor_settled(&step).await? {
            return Ok(());
        }

        let Some(handler) = self.registry.get(&step.name) else {
            self.deps
                .log
                .warning(
                    &step.task_id,
                    format!(
                        "[Dispatcher] No handler registered for step name '{}' (step {})",
                        step.name, step.step_id
                    ),
                )
                .await;
            return Ok(());
        };

        self.deps
            .log
            .info(
                &step.task_id,
                format!("[Dispatcher] Running step {} ({})", step.step_id, step.name),
            )
            .await;

        match handler {
            Handler::Init => {
                self.initializer.initialize(&step).await?;
            }
            Handler::Delegate(def) => self.run_delegate(def, &step).await?,
            Handler::FanOut(def) => self.run_fan_out(def, &step).await?,
        }
        Ok(())
    }

    /// Subscribe to `source` and dispatch every event on its own task until
    /// the stream ends. Events for a step whose handler is still running are
    /// dropped. In-flight handlers are awaited before returning.
    pub async fn serve(
        &self,
        source: &dyn EventSource,
        options: SubscribeOptions,
    ) -> Result<(), BatonError> {
        let mut events = source.subscribe(options).await?;
        let mut in_flight = JoinSet::new();
        let mut handling: HashMap<task::Id, String> = HashMap::new();
        let mut active: HashSet<String> = HashSet::new();
        tracing::info!(
            "[Dispatcher] Listening for step events ({} handlers)",
            self.registry.step_names().len() + 1
        );

        loop {
            tokio::select! {
                // Finished handlers release their step before the next event is read.
                biased;
                Some(joined) = in_flight.join_next_with_id(), if !in_flight.is_empty() => {
                    settle(joined, &mut handling, &mut active);
                }
                next = events.recv() => {
                    let Some(event) = next else { break };
                    if !active.insert(event.step_id.clone()) {
                        tracing::debug!(
                            "[Dispatcher] Step {} is already being handled; dropping event",
                            event.step_id
                        );
                        continue;
                    }
                    let step_id = event.step_id.clone();
                    let this = self.clone();
                    let handle = in_flight.spawn(async move {
                        if let Err(e) = this.dispatch(&event).await {
                            tracing::error!(
                                "[Dispatcher] Failed to handle step {}: {}",
                                event.step_id,
                                e
                            );
                        }
                    });
                    handling.insert(handle.id(), step_id);
                }
            }
        }

        tracing::info!("[Dispatcher] Event stream closed; draining {} handlers", in_flight.len());
        while let Some(joined) = in_flight.join_next_with_id().await {
            settle(joined, &mut handling, &mut active);
        }
        Ok(())
    }

    /// A successor may only run once its predecessor is terminal.
    async fn predecessor_settled(&self, step: &Step) -> Result<bool, BatonError> {
        let Some(predecessor_id) = step.predecessor.as_deref() else {
            return Ok(true);
        };
        match self.deps.steps.get_step(predecessor_id).await {
            Ok(predecessor) if predecessor.status.is_terminal() => Ok(true),
            Ok(predecessor) => {
                self.deps
                    .log
                    .warning(
                        &step.task_id,
                        format!(
                            "[Dispatcher] Step {} is Pending but its predecessor {} is {}; skipping",
                            step.step_id, predecessor.step_id, predecessor.status
                        ),
                    )
                    .await;
                Ok(false)
            }
            Err(BatonError::NotFound(_)) => {
                tracing::warn!(
                    "[Dispatcher] Predecessor {} of step {} not found; continuing",
                    predecessor_id,
                    step.step_id
                );
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_delegate(&self, def: &StepDefinition, step: &Step) -> Result<(), BatonError> {
        // Balance read faults propagate; the step stays Pending.
        if !self.guard.ensure_balance(&def.plan, step, 1).await? {
            return Ok(());
        }

        let variables = &self.registry.workflow().variables;
        let inputs = step.input_artifacts.items(None).unwrap_or_default();
        let prompt = render_prompt(
            def.prompt.as_deref(),
            &PromptContext {
                query: &step.input_query,
                item: None,
                inputs: &inputs,
                variables,
            },
        );

        match self.delegator.delegate_step(def, &prompt, step).await {
            Ok(_) => Ok(()),
            Err(e @ (BatonError::Delegation { .. } | BatonError::Timeout(_))) => {
                self.fail(step, e.to_string()).await
            }
            Err(e) => Err(e),
        }
    }

    async fn run_fan_out(&self, def: &StepDefinition, step: &Step) -> Result<(), BatonError> {
        let items = match step.input_artifacts.items(def.items) {
            Ok(items) => items,
            Err(e) => {
                return self
                    .fail(step, format!("Cannot fan out step '{}': {}", step.name, e))
                    .await
            }
        };

        let variables = &self.registry.workflow().variables;
        let query = step.input_query.as_str();
        let prompt_fn = |item: &str| {
            render_prompt(
                def.prompt.as_deref(),
                &PromptContext {
                    query,
                    item: Some(item),
                    inputs: &items,
                    variables,
                },
            )
        };

        self.fan_out.run_fan_out(def, step, &items, prompt_fn).await?;
        Ok(())
    }

    async fn fail(&self, step: &Step, message: String) -> Result<(), BatonError> {
        self.deps.log.error(&step.task_id, message.clone()).await;
        self.deps.persist_step(&step.failed(message)).await?;
        Ok(())
    }
}

/// Release the step a finished handler task was holding.
fn settle(
    joined: Result<(task::Id, ()), JoinError>,
    handling: &mut HashMap<task::Id, String>,
    active: &mut HashSet<String>,
) {
    let id = match joined {
        Ok((id, ())) => id,
        Err(e) => {
            tracing::error!("[Dispatcher] Step handler panicked: {}", e);
            e.id()
        }
    };
    if let Some(step_id) = handling.remove(&id) {
        active.remove(&step_id);
    }
}
