//! YAML schema types for workflow definitions.
//!
//! A workflow is an ordered chain of named steps. The implicit first step,
//! `init`, expands the chain; every declared step either delegates to one
//! agent or fans out over the artifacts its predecessor produced:
//!
//! ```yaml
//! name: "Music video"
//! version: "1.0"
//!
//! variables:
//!   image_agent: "${IMAGE_AGENT_ID}"
//!
//! steps:
//!   - name: "generateScript"
//!     kind: delegate
//!     agent: "${SCRIPT_AGENT_ID}"
//!     plan: "${SCRIPT_PLAN_ID}"
//!     prompt: "Write a shot list for: ${query}"
//!
//!   - name: "generateImages"
//!     kind: fan_out
//!     agent: "${variables.image_agent}"
//!     plan: "${IMAGE_PLAN_ID}"
//!     items: prompts
//!     prompt: "Cinematic still, 16:9. ${item}"
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::resolve_env_vars;
use crate::error::BatonError;
use crate::models::ArtifactKind;

/// Name of the implicit step that expands a workflow into its chain.
pub const INIT_STEP: &str = "init";

/// Top-level workflow definition loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    /// Substitution map, referenced as `${variables.<key>}`. Values may
    /// themselves reference the environment.
    #[serde(default)]
    pub variables: HashMap<String, String>,

    /// Ordered successors of `init`.
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// One delegation whose result is the step's result.
    #[default]
    Delegate,
    /// One delegation per input artifact, joined all-or-nothing.
    FanOut,
}

/// A single step in the workflow chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name, unique within the workflow; selects the handler.
    pub name: String,

    #[serde(default)]
    pub kind: StepKind,

    /// Agent that performs the work.
    pub agent: String,

    /// Plan whose credits pay for the delegation.
    pub plan: String,

    /// Prompt template:
    ///  - `${query}`: the step's input query
    ///  - `${item}`: the current fan-out item
    ///  - `${inputs}`: the step's input artifacts, one per line
    ///  - `${variables.<key>}`: from the variables block
    ///  - `${ENV_VAR}`: from the environment
    #[serde(default)]
    pub prompt: Option<String>,

    /// Artifact kind a fan-out step expects from its predecessor.
    #[serde(default)]
    pub items: Option<ArtifactKind>,

    /// Name given to the remote task; defaults to the step name.
    #[serde(default)]
    pub task_name: Option<String>,
}

impl StepDefinition {
    pub fn remote_task_name(&self) -> &str {
        self.task_name.as_deref().unwrap_or(&self.name)
    }
}

impl WorkflowDefinition {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, BatonError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| BatonError::Config(format!("Failed to parse workflow YAML: {}", e)))
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, BatonError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BatonError::Config(format!("Failed to read workflow file '{}': {}", path, e)))?;
        Self::from_yaml(&content)
    }

    /// Load, validate and resolve references in one go.
    pub fn load(path: &str) -> Result<Self, BatonError> {
        let wf = Self::from_file(path)?;
        wf.validate()?;
        Ok(wf.resolved())
    }

    /// Report the first structural problem, if any.
    pub fn validate(&self) -> Result<(), BatonError> {
        if self.steps.is_empty() {
            return Err(BatonError::Config(format!(
                "Workflow '{}' declares no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name == INIT_STEP {
                return Err(BatonError::Config(format!(
                    "Step name '{}' is reserved",
                    INIT_STEP
                )));
            }
            if step.name.trim().is_empty() {
                return Err(BatonError::Config("Step names must not be empty".to_string()));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(BatonError::Config(format!(
                    "Duplicate step name '{}'",
                    step.name
                )));
            }
            if step.kind == StepKind::FanOut && step.items.is_none() {
                return Err(BatonError::Config(format!(
                    "Fan-out step '{}' must declare `items`",
                    step.name
                )));
            }
        }
        Ok(())
    }

    /// Copy with variables, agents and plans resolved against the variables
    /// block and the environment. Prompt templates stay untouched; they are
    /// rendered per delegation.
    pub fn resolved(&self) -> Self {
        let variables: HashMap<String, String> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), resolve_env_vars(v)))
            .collect();

        let resolve = |value: &str| {
            let mut out = value.to_string();
            for (key, val) in &variables {
                out = out.replace(&format!("${{variables.{}}}", key), val);
            }
            resolve_env_vars(&out)
        };

        let steps = self
            .steps
            .iter()
            .map(|s| StepDefinition {
                agent: resolve(&s.agent),
                plan: resolve(&s.plan),
                ..s.clone()
            })
            .collect();

        Self {
            variables,
            steps,
            ..self.clone()
        }
    }
}
