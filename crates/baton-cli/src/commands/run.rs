//! `baton run` — serve step events until interrupted.

use baton_core::config::BatonConfig;
use baton_core::ledger::SubscribeOptions;
use baton_core::Dispatcher;

use super::{init_runtime, load_registry};

/// Event type the ledger emits when a step changes.
const STEP_UPDATED: &str = "step-updated";

pub async fn run(config: &BatonConfig) -> Result<(), String> {
    let registry = load_registry(config)?;
    let runtime = init_runtime(config)?;

    let workflow_name = registry.workflow().name.clone();
    let dispatcher = Dispatcher::from_parts(
        runtime.deps.clone(),
        registry,
        config.delegation_timeout(),
    );

    let rooms = if config.ledger.agent_id.is_empty() {
        Vec::new()
    } else {
        vec![config.ledger.agent_id.clone()]
    };
    let options = SubscribeOptions {
        join_agent_rooms: rooms,
        subscribe_event_types: vec![STEP_UPDATED.to_string()],
        get_pending_events_on_subscribe: true,
    };

    println!(
        "Serving workflow '{}' ({:?} step store). Press Ctrl+C to stop.",
        workflow_name, config.store.backend
    );

    tokio::select! {
        served = dispatcher.serve(runtime.events.as_ref(), options) => {
            served.map_err(|e| e.to_string())?;
            tracing::info!("[Run] Event stream ended");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("[Run] Interrupted, shutting down");
        }
    }
    Ok(())
}
