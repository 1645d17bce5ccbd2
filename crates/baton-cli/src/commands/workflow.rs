//! `baton workflow` — inspect workflow definitions.

use serde::Serialize;

use baton_core::workflow::{StepKind, WorkflowDefinition, INIT_STEP};

/// Validate a workflow YAML file without running it.
pub fn validate(workflow_file: &str) -> Result<(), String> {
    let workflow = WorkflowDefinition::from_file(workflow_file).map_err(|e| e.to_string())?;
    workflow.validate().map_err(|e| e.to_string())?;

    println!("✅ Workflow '{}' is valid", workflow.name);
    println!("   Version: {}", workflow.version);
    println!("   Steps: {} (after implicit '{}')", workflow.steps.len(), INIT_STEP);

    for (i, step) in workflow.steps.iter().enumerate() {
        let kind = match step.kind {
            StepKind::Delegate => "delegate".to_string(),
            StepKind::FanOut => format!(
                "fan_out over {}",
                step.items.map(|k| k.to_string()).unwrap_or_default()
            ),
        };
        println!(
            "   {}. {} ({}, agent: {}, plan: {})",
            i + 1,
            step.name,
            kind,
            step.agent,
            step.plan
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct ChainEntry<'a> {
    position: usize,
    name: &'a str,
    predecessor: &'a str,
    is_last: bool,
}

/// Print the resolved workflow and the step chain `init` would create.
pub fn show(workflow_file: &str) -> Result<(), String> {
    let workflow = WorkflowDefinition::load(workflow_file).map_err(|e| e.to_string())?;

    let yaml = serde_yaml::to_string(&workflow).map_err(|e| e.to_string())?;
    println!("{}", yaml);

    let chain: Vec<ChainEntry<'_>> = workflow
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| ChainEntry {
            position: i + 1,
            name: &step.name,
            predecessor: if i == 0 {
                INIT_STEP
            } else {
                workflow.steps[i - 1].name.as_str()
            },
            is_last: i + 1 == workflow.steps.len(),
        })
        .collect();
    super::print_json(&serde_json::json!({ "chain": chain }));
    Ok(())
}
