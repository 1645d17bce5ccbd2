//! `baton step` — start and inspect workflow instances.

use baton_core::config::BatonConfig;
use baton_core::models::{Step, StepStatus};
use baton_core::store::StepStore;
use baton_core::workflow::INIT_STEP;

use super::{init_runtime, print_json, Runtime};

/// Create a Pending `init` step, which starts a workflow instance on the
/// local step store. Prints the new step.
pub async fn trigger(
    config: &BatonConfig,
    task_id: Option<&str>,
    query: &str,
) -> Result<(), String> {
    let runtime = init_runtime(config)?;
    let step = create_trigger(&runtime, task_id, query).await?;
    print_json(&serde_json::to_value(&step).map_err(|e| e.to_string())?);
    Ok(())
}

pub async fn create_trigger(
    runtime: &Runtime,
    task_id: Option<&str>,
    query: &str,
) -> Result<Step, String> {
    let store = runtime.local_store()?;
    let task_id = task_id
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut step = Step::new(&task_id, INIT_STEP, None, StepStatus::Pending);
    step.input_query = query.to_string();

    let resp = store
        .create_steps(&task_id, vec![step.clone()])
        .await
        .map_err(|e| e.to_string())?;
    if !resp.is_success() {
        return Err(format!(
            "Step store refused the trigger ({}): {}",
            resp.status,
            resp.data_text()
        ));
    }
    tracing::info!("[Step] Triggered task {} with step {}", task_id, step.step_id);
    Ok(step)
}

pub async fn get(config: &BatonConfig, step_id: &str) -> Result<(), String> {
    let runtime = init_runtime(config)?;
    let step = runtime
        .deps
        .steps
        .get_step(step_id)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::to_value(&step).map_err(|e| e.to_string())?);
    Ok(())
}

/// List every step of a workflow instance in creation order.
pub async fn list(config: &BatonConfig, task_id: &str) -> Result<(), String> {
    let runtime = init_runtime(config)?;
    let steps = runtime
        .local_store()?
        .list_by_task(task_id)
        .await
        .map_err(|e| e.to_string())?;

    if steps.is_empty() {
        println!("No steps for task {}", task_id);
        return Ok(());
    }
    println!("{:<38} {:<20} {:<10} LAST", "STEP", "NAME", "STATUS");
    for step in &steps {
        println!(
            "{:<38} {:<20} {:<10} {}",
            step.step_id,
            step.name,
            step.status.as_str(),
            if step.is_last { "yes" } else { "" }
        );
    }
    Ok(())
}
