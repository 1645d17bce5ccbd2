//! `baton dispatch` — handle one step event and exit.

use baton_core::config::BatonConfig;
use baton_core::models::StepEvent;
use baton_core::store::StepStore;
use baton_core::Dispatcher;

use super::{init_runtime, load_registry, print_json};

pub async fn run(config: &BatonConfig, step_id: &str) -> Result<(), String> {
    let registry = load_registry(config)?;
    let runtime = init_runtime(config)?;
    let dispatcher = Dispatcher::from_parts(
        runtime.deps.clone(),
        registry,
        config.delegation_timeout(),
    );

    dispatcher
        .dispatch(&StepEvent {
            step_id: step_id.to_string(),
        })
        .await
        .map_err(|e| e.to_string())?;

    let step = runtime
        .deps
        .steps
        .get_step(step_id)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::to_value(&step).map_err(|e| e.to_string())?);
    Ok(())
}
