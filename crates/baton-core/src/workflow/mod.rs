//! Workflow definitions and the step-name → handler registry.
//!
//! ```text
//! workflow.yaml ──► WorkflowDefinition ──► HandlerRegistry ──► Dispatcher
//!                                               │
//!                          init ─► Initializer  │
//!                      delegate ─► single delegation
//!                       fan_out ─► Fan-out/Join
//! ```
//!
//! Image and video pipelines are two definitions over the same handlers.

pub mod schema;
pub mod template;

use std::collections::HashMap;

pub use schema::{StepDefinition, StepKind, WorkflowDefinition, INIT_STEP};
pub use template::{render_prompt, PromptContext};

/// What the dispatcher runs for a given step name.
#[derive(Debug, Clone)]
pub enum Handler {
    Init,
    Delegate(StepDefinition),
    FanOut(StepDefinition),
}

/// Maps step names to handlers for one workflow definition.
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    workflow: WorkflowDefinition,
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new(workflow: WorkflowDefinition) -> Self {
        let mut handlers = HashMap::new();
        handlers.insert(INIT_STEP.to_string(), Handler::Init);
        for step in &workflow.steps {
            let handler = match step.kind {
                StepKind::Delegate => Handler::Delegate(step.clone()),
                StepKind::FanOut => Handler::FanOut(step.clone()),
            };
            handlers.insert(step.name.clone(), handler);
        }
        Self { workflow, handlers }
    }

    pub fn get(&self, step_name: &str) -> Option<&Handler> {
        self.handlers.get(step_name)
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.workflow.steps.iter().map(|s| s.name.as_str()).collect()
    }
}
