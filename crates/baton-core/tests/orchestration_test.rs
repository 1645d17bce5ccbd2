mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use baton_core::ledger::{EventSource, LogLevel, StepEventStream, SubscribeOptions};
use baton_core::models::{Artifacts, MediaArtifact, Step, StepEvent, StepStatus};
use baton_core::orchestration::BalanceGuard;
use baton_core::store::{SqliteStepStore, StepStore, StoreResponse};
use baton_core::{BatonError, Collaborators, Dispatcher, HandlerRegistry, WorkflowDefinition};

use common::{media_url, Behaviour, Harness, VIDEO_WORKFLOW};

/// Accepts reads and updates, refuses every chain creation.
struct RefusingStore {
    inner: SqliteStepStore,
}

#[async_trait::async_trait]
impl StepStore for RefusingStore {
    async fn get_step(&self, step_id: &str) -> Result<Step, BatonError> {
        self.inner.get_step(step_id).await
    }

    async fn create_steps(&self, _task_id: &str, _steps: Vec<Step>) -> Result<StoreResponse, BatonError> {
        Ok(StoreResponse::rejected(
            422,
            serde_json::json!({ "error": "step quota exceeded" }),
        ))
    }

    async fn update_step(&self, step: &Step) -> Result<StoreResponse, BatonError> {
        self.inner.update_step(step).await
    }
}

/// Accepts reads and chain creation; every step write fails in transport.
struct UnreachableWritesStore {
    inner: SqliteStepStore,
    writes: std::sync::atomic::AtomicUsize,
}

#[async_trait::async_trait]
impl StepStore for UnreachableWritesStore {
    async fn get_step(&self, step_id: &str) -> Result<Step, BatonError> {
        self.inner.get_step(step_id).await
    }

    async fn create_steps(&self, task_id: &str, steps: Vec<Step>) -> Result<StoreResponse, BatonError> {
        self.inner.create_steps(task_id, steps).await
    }

    async fn update_step(&self, _step: &Step) -> Result<StoreResponse, BatonError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(BatonError::Ledger("connection reset by peer".to_string()))
    }
}

/// Event source fed by the test through the returned sender.
struct ManualEvents {
    stream: std::sync::Mutex<Option<StepEventStream>>,
}

impl ManualEvents {
    fn new() -> (Self, tokio::sync::mpsc::Sender<StepEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let source = Self {
            stream: std::sync::Mutex::new(Some(rx)),
        };
        (source, tx)
    }
}

#[async_trait::async_trait]
impl EventSource for ManualEvents {
    async fn subscribe(&self, _options: SubscribeOptions) -> Result<StepEventStream, BatonError> {
        self.stream
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BatonError::Internal("already subscribed".to_string()))
    }
}

fn event(step: &Step) -> StepEvent {
    StepEvent {
        step_id: step.step_id.clone(),
    }
}

fn pending(task_id: &str, name: &str) -> Step {
    Step::new(task_id, name, None, StepStatus::Pending)
}

fn fan_out_step(items: Vec<&str>) -> Step {
    let mut step = pending("t-fan", "generateImages");
    step.input_artifacts = Artifacts::Prompts(items.into_iter().map(String::from).collect());
    step
}

#[tokio::test]
async fn test_resolved_step_is_not_touched_again() {
    let h = Harness::new(VIDEO_WORKFLOW);
    let done = pending("t-1", "generateScript").completed("already done", Artifacts::Empty);
    h.seed(vec![done.clone()]).await;

    h.dispatcher.dispatch(&event(&done)).await.unwrap();
    h.dispatcher.dispatch(&event(&done)).await.unwrap();

    assert_eq!(h.updates(), 0);
    assert_eq!(h.ledger.created_count(), 0);
    assert_eq!(h.step(&done.step_id).await.output.as_deref(), Some("already done"));
    assert!(h.ledger.logged(LogLevel::Warning, "not Pending"));
}

#[tokio::test]
async fn test_unknown_step_name_is_ignored() {
    let h = Harness::new(VIDEO_WORKFLOW);
    let stray = pending("t-1", "doesNotExist");
    h.seed(vec![stray.clone()]).await;

    h.dispatcher.dispatch(&event(&stray)).await.unwrap();

    assert_eq!(h.step(&stray.step_id).await.status, StepStatus::Pending);
    assert_eq!(h.updates(), 0);
    assert!(h.ledger.logged(LogLevel::Warning, "doesNotExist"));
}

#[tokio::test]
async fn test_missing_step_is_an_error() {
    let h = Harness::new(VIDEO_WORKFLOW);
    let err = h
        .dispatcher
        .dispatch(&StepEvent {
            step_id: "nope".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BatonError::NotFound(_)));
}

#[tokio::test]
async fn test_init_builds_chain_and_completes_trigger() {
    let h = Harness::new(VIDEO_WORKFLOW);
    let mut trigger = pending("t-init", "init");
    trigger.input_query = "a lighthouse at dusk".to_string();
    h.seed(vec![trigger.clone()]).await;

    h.dispatcher.dispatch(&event(&trigger)).await.unwrap();

    let resolved = h.step(&trigger.step_id).await;
    assert_eq!(resolved.status, StepStatus::Completed);
    assert_eq!(resolved.output.as_deref(), Some("a lighthouse at dusk"));

    let steps = h.store.inner.list_by_task("t-init").await.unwrap();
    let successors: Vec<&Step> = steps.iter().filter(|s| s.name != "init").collect();
    assert_eq!(successors.len(), 2);

    let script = successors.iter().find(|s| s.name == "generateScript").unwrap();
    let images = successors.iter().find(|s| s.name == "generateImages").unwrap();
    assert_eq!(script.predecessor.as_deref(), Some(trigger.step_id.as_str()));
    assert_eq!(images.predecessor.as_deref(), Some(script.step_id.as_str()));
    assert!(!script.is_last);
    assert!(images.is_last);
    // Completing the trigger activates only the first successor.
    assert_eq!(script.status, StepStatus::Pending);
    assert_eq!(script.input_query, "a lighthouse at dusk");
    assert_eq!(images.status, StepStatus::NotReady);
}

#[tokio::test]
async fn test_init_fails_trigger_when_chain_is_refused() {
    let h = Harness::new(VIDEO_WORKFLOW);
    let refusing = Arc::new(RefusingStore {
        inner: h.store.inner.clone(),
    });
    let deps = Collaborators {
        steps: refusing,
        ..h.deps.clone()
    };
    let workflow = WorkflowDefinition::from_yaml(VIDEO_WORKFLOW).unwrap();
    let dispatcher = Dispatcher::from_parts(deps, HandlerRegistry::new(workflow), Duration::from_secs(5));

    let trigger = pending("t-init", "init");
    h.seed(vec![trigger.clone()]).await;

    dispatcher.dispatch(&event(&trigger)).await.unwrap();

    let resolved = h.step(&trigger.step_id).await;
    assert_eq!(resolved.status, StepStatus::Failed);
    assert!(resolved.output.unwrap_or_default().contains("step quota exceeded"));
    assert_eq!(h.store.inner.list_by_task("t-init").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_store_fault_while_resolving_step_propagates() {
    let h = Harness::new(VIDEO_WORKFLOW);
    let store = Arc::new(UnreachableWritesStore {
        inner: h.store.inner.clone(),
        writes: std::sync::atomic::AtomicUsize::new(0),
    });
    let deps = Collaborators {
        steps: store.clone(),
        ..h.deps.clone()
    };
    let workflow = WorkflowDefinition::from_yaml(VIDEO_WORKFLOW).unwrap();
    let dispatcher = Dispatcher::from_parts(deps, HandlerRegistry::new(workflow), Duration::from_secs(5));

    let step = pending("t-1", "generateScript");
    h.seed(vec![step.clone()]).await;

    let err = dispatcher.dispatch(&event(&step)).await.unwrap_err();
    assert!(matches!(err, BatonError::Ledger(_)), "unexpected error: {}", err);
    assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    assert_eq!(h.step(&step.step_id).await.status, StepStatus::Pending);
}

#[tokio::test]
async fn test_single_delegation_completes_step() {
    let h = Harness::new(VIDEO_WORKFLOW);
    h.ledger.script_agent(
        "script-agent",
        Behaviour::completes_with(
            "INT. LIGHTHOUSE - NIGHT",
            Artifacts::Prompts(vec!["wide shot".into(), "close up".into()]),
        ),
    );
    let mut step = pending("t-1", "generateScript");
    step.input_query = "a lighthouse".to_string();
    h.seed(vec![step.clone()]).await;

    h.dispatcher.dispatch(&event(&step)).await.unwrap();

    let resolved = h.step(&step.step_id).await;
    assert_eq!(resolved.status, StepStatus::Completed);
    assert_eq!(resolved.output.as_deref(), Some("INT. LIGHTHOUSE - NIGHT"));
    assert_eq!(
        resolved.output_artifacts,
        Artifacts::Prompts(vec!["wide shot".into(), "close up".into()])
    );
    assert_eq!(h.ledger.created_queries(), vec!["Write a script for: a lighthouse"]);
    assert_eq!(h.ledger.access_fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_delegation_resolves_once_on_first_terminal_status() {
    let h = Harness::new(VIDEO_WORKFLOW);
    h.ledger.script_agent(
        "script-agent",
        Behaviour {
            progress: vec!["Running", "Running"],
            trailing: vec!["Completed", "Failed"],
            ..Behaviour::completes_with("ok", Artifacts::Empty)
        },
    );
    let step = pending("t-1", "generateScript");
    h.seed(vec![step.clone()]).await;

    h.dispatcher.dispatch(&event(&step)).await.unwrap();

    assert_eq!(h.step(&step.step_id).await.status, StepStatus::Completed);
    assert_eq!(h.ledger.task_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.updates(), 1);
}

#[tokio::test]
async fn test_remote_failure_fails_step_with_agent_output() {
    let h = Harness::new(VIDEO_WORKFLOW);
    h.ledger
        .script_agent("script-agent", Behaviour::fails_with("model overloaded"));
    let step = pending("t-1", "generateScript");
    h.seed(vec![step.clone()]).await;

    h.dispatcher.dispatch(&event(&step)).await.unwrap();

    let resolved = h.step(&step.step_id).await;
    assert_eq!(resolved.status, StepStatus::Failed);
    assert_eq!(resolved.output.as_deref(), Some("model overloaded"));
}

#[tokio::test]
async fn test_rejected_task_creation_fails_step() {
    let h = Harness::new(VIDEO_WORKFLOW);
    h.ledger.script_agent(
        "script-agent",
        Behaviour {
            create_status: 503,
            ..Behaviour::default()
        },
    );
    let step = pending("t-1", "generateScript");
    h.seed(vec![step.clone()]).await;

    h.dispatcher.dispatch(&event(&step)).await.unwrap();

    let resolved = h.step(&step.step_id).await;
    assert_eq!(resolved.status, StepStatus::Failed);
    let output = resolved.output.unwrap_or_default();
    assert!(output.contains("rejected"), "output was {}", output);
    assert_eq!(h.ledger.task_fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_notification_names_the_agent() {
    let h = Harness::new(VIDEO_WORKFLOW);
    h.ledger.script_agent(
        "script-agent",
        Behaviour {
            malformed: true,
            ..Behaviour::default()
        },
    );
    let step = pending("t-1", "generateScript");
    h.seed(vec![step.clone()]).await;

    h.dispatcher.dispatch(&event(&step)).await.unwrap();

    let resolved = h.step(&step.step_id).await;
    assert_eq!(resolved.status, StepStatus::Failed);
    let output = resolved.output.unwrap_or_default();
    assert!(output.contains("script-agent"), "output was {}", output);
    assert!(output.contains("malformed"), "output was {}", output);
}

#[tokio::test]
async fn test_silent_agent_times_out() {
    let h = Harness::with_timeout(VIDEO_WORKFLOW, Duration::from_millis(100));
    h.ledger.script_agent(
        "script-agent",
        Behaviour {
            silent: true,
            ..Behaviour::default()
        },
    );
    let step = pending("t-1", "generateScript");
    h.seed(vec![step.clone()]).await;

    h.dispatcher.dispatch(&event(&step)).await.unwrap();

    let resolved = h.step(&step.step_id).await;
    assert_eq!(resolved.status, StepStatus::Failed);
    assert!(resolved.output.unwrap_or_default().contains("Timed out"));
}

#[tokio::test]
async fn test_insufficient_balance_with_failed_top_up() {
    let h = Harness::new(VIDEO_WORKFLOW);
    h.ledger.set_balance("plan-script", 0);
    h.ledger.set_order_succeeds(false);
    let step = pending("t-1", "generateScript");
    h.seed(vec![step.clone()]).await;

    h.dispatcher.dispatch(&event(&step)).await.unwrap();

    let resolved = h.step(&step.step_id).await;
    assert_eq!(resolved.status, StepStatus::Failed);
    assert!(resolved
        .output
        .unwrap_or_default()
        .contains("Insufficient balance"));
    assert_eq!(h.ledger.orders.load(Ordering::SeqCst), 1);
    assert_eq!(h.ledger.created_count(), 0);
}

#[tokio::test]
async fn test_balance_guard_top_up_success_does_not_touch_step() {
    let h = Harness::new(VIDEO_WORKFLOW);
    h.ledger.set_balance("plan-x", 0);
    h.ledger.set_order_succeeds(true);
    let step = pending("t-1", "generateScript");
    h.seed(vec![step.clone()]).await;

    let guard = BalanceGuard::new(h.deps.clone());
    assert!(guard.ensure_balance("plan-x", &step, 1).await.unwrap());

    assert_eq!(h.ledger.orders.load(Ordering::SeqCst), 1);
    assert_eq!(h.ledger.balance_reads.load(Ordering::SeqCst), 1);
    assert_eq!(h.updates(), 0);
    assert_eq!(h.step(&step.step_id).await.status, StepStatus::Pending);
}

#[tokio::test]
async fn test_balance_guard_sufficient_balance_orders_nothing() {
    let h = Harness::new(VIDEO_WORKFLOW);
    h.ledger.set_balance("plan-x", 3);
    let step = pending("t-1", "generateImages");

    let guard = BalanceGuard::new(h.deps.clone());
    assert!(guard.ensure_balance("plan-x", &step, 3).await.unwrap());
    assert_eq!(h.ledger.orders.load(Ordering::SeqCst), 0);
    assert_eq!(h.updates(), 0);
}

#[tokio::test]
async fn test_fan_out_joins_artifacts_in_item_order() {
    let h = Harness::new(VIDEO_WORKFLOW);
    h.ledger.set_balance("plan-images", 3);
    h.ledger.script_agent(
        "image-agent",
        Behaviour {
            echo_media: true,
            ..Behaviour::default()
        },
    );
    let step = fan_out_step(vec!["a", "b", "c"]);
    h.seed(vec![step.clone()]).await;

    h.dispatcher.dispatch(&event(&step)).await.unwrap();

    let resolved = h.step(&step.step_id).await;
    assert_eq!(resolved.status, StepStatus::Completed);
    let urls: Vec<String> = match &resolved.output_artifacts {
        Artifacts::Media(media) => media.iter().map(|m: &MediaArtifact| m.url.clone()).collect(),
        other => panic!("expected media, got {:?}", other),
    };
    assert_eq!(
        urls,
        vec![
            media_url("watercolor: a"),
            media_url("watercolor: b"),
            media_url("watercolor: c"),
        ]
    );
    // One guard check for the whole batch, exactly covered by the balance.
    assert_eq!(h.ledger.balance_reads.load(Ordering::SeqCst), 1);
    assert_eq!(h.ledger.orders.load(Ordering::SeqCst), 0);
    assert_eq!(h.ledger.created_count(), 3);
}

#[tokio::test]
async fn test_fan_out_is_all_or_nothing() {
    let h = Harness::new(VIDEO_WORKFLOW);
    h.ledger.script_agent(
        "image-agent",
        Behaviour {
            echo_media: true,
            ..Behaviour::default()
        },
    );
    h.ledger
        .script_query("watercolor: b", Behaviour::fails_with("nsfw filter"));
    let step = fan_out_step(vec!["a", "b", "c"]);
    h.seed(vec![step.clone()]).await;

    h.dispatcher.dispatch(&event(&step)).await.unwrap();

    let resolved = h.step(&step.step_id).await;
    assert_eq!(resolved.status, StepStatus::Failed);
    let output = resolved.output.unwrap_or_default();
    assert!(output.contains("1 of 3 sub-tasks failed"), "output was {}", output);
    assert!(output.contains("nsfw filter"), "output was {}", output);
    assert_eq!(resolved.output_artifacts, Artifacts::Empty);
    // Every branch ran to completion before the join resolved.
    assert_eq!(h.ledger.created_count(), 3);
    assert_eq!(h.updates(), 1);
}

#[tokio::test]
async fn test_fan_out_with_no_items_skips_the_guard() {
    let h = Harness::new(VIDEO_WORKFLOW);
    let step = fan_out_step(vec![]);
    h.seed(vec![step.clone()]).await;

    h.dispatcher.dispatch(&event(&step)).await.unwrap();

    let resolved = h.step(&step.step_id).await;
    assert_eq!(resolved.status, StepStatus::Completed);
    assert_eq!(resolved.output_artifacts, Artifacts::Empty);
    assert_eq!(h.ledger.balance_reads.load(Ordering::SeqCst), 0);
    assert_eq!(h.ledger.created_count(), 0);
}

#[tokio::test]
async fn test_fan_out_balance_sized_to_width() {
    let h = Harness::new(VIDEO_WORKFLOW);
    h.ledger.set_balance("plan-images", 2);
    h.ledger.set_order_succeeds(false);
    let step = fan_out_step(vec!["a", "b", "c"]);
    h.seed(vec![step.clone()]).await;

    h.dispatcher.dispatch(&event(&step)).await.unwrap();

    let resolved = h.step(&step.step_id).await;
    assert_eq!(resolved.status, StepStatus::Failed);
    assert!(resolved
        .output
        .unwrap_or_default()
        .contains("Insufficient balance"));
    assert_eq!(h.ledger.created_count(), 0);
}

#[tokio::test]
async fn test_fan_out_rejects_wrong_artifact_kind() {
    let h = Harness::new(VIDEO_WORKFLOW);
    let mut step = pending("t-fan", "generateImages");
    step.input_artifacts = Artifacts::Media(vec![MediaArtifact {
        url: "https://cdn.test/x.png".into(),
        mime_type: None,
        caption: None,
    }]);
    h.seed(vec![step.clone()]).await;

    h.dispatcher.dispatch(&event(&step)).await.unwrap();

    let resolved = h.step(&step.step_id).await;
    assert_eq!(resolved.status, StepStatus::Failed);
    assert!(resolved.output.unwrap_or_default().contains("expected prompts"));
    assert_eq!(h.ledger.created_count(), 0);
}

#[tokio::test]
async fn test_step_with_unsettled_predecessor_waits() {
    let h = Harness::new(VIDEO_WORKFLOW);
    let head = pending("t-1", "generateScript");
    let mut next = pending("t-1", "generateImages");
    next.predecessor = Some(head.step_id.clone());
    h.seed(vec![head.clone(), next.clone()]).await;

    h.dispatcher.dispatch(&event(&next)).await.unwrap();

    assert_eq!(h.step(&next.step_id).await.status, StepStatus::Pending);
    assert_eq!(h.ledger.created_count(), 0);
    assert_eq!(h.updates(), 0);
}

#[tokio::test]
async fn test_serve_runs_workflow_to_the_last_step() {
    let h = Harness::new(VIDEO_WORKFLOW);
    h.ledger.script_agent(
        "script-agent",
        Behaviour::completes_with(
            "script",
            Artifacts::Prompts(vec!["opening".into(), "finale".into()]),
        ),
    );
    h.ledger.script_agent(
        "image-agent",
        Behaviour {
            echo_media: true,
            ..Behaviour::default()
        },
    );

    // Seeded before subscribing, so it arrives through the backlog only.
    let mut trigger = pending("t-e2e", "init");
    trigger.input_query = "rain on a tin roof".to_string();
    h.seed(vec![trigger]).await;

    let source = h.store.inner.clone();
    let dispatcher = h.dispatcher.clone();
    let server = tokio::spawn(async move {
        dispatcher
            .serve(
                &source,
                SubscribeOptions {
                    get_pending_events_on_subscribe: true,
                    ..Default::default()
                },
            )
            .await
    });

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let steps = h.store.inner.list_by_task("t-e2e").await.unwrap();
            if let Some(last) = steps.iter().find(|s| s.is_last) {
                if last.status.is_terminal() {
                    return steps;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("workflow finished");
    server.abort();

    assert_eq!(finished.len(), 3);
    assert!(finished.iter().all(|s| s.status == StepStatus::Completed));
    let images = finished.iter().find(|s| s.name == "generateImages").unwrap();
    assert_eq!(images.input_artifacts.len(), 2);
    assert_eq!(images.output_artifacts.len(), 2);
    assert!(h.ledger.logged(LogLevel::Info, "[Initializer] Created 2 steps"));
}

#[tokio::test]
async fn test_serve_drops_events_for_a_step_already_in_flight() {
    let h = Harness::with_timeout(VIDEO_WORKFLOW, Duration::from_millis(300));
    h.ledger.script_agent(
        "script-agent",
        Behaviour {
            silent: true,
            ..Behaviour::default()
        },
    );
    let step = pending("t-1", "generateScript");
    h.seed(vec![step.clone()]).await;

    let (source, tx) = ManualEvents::new();
    tx.send(event(&step)).await.unwrap();
    tx.send(event(&step)).await.unwrap();
    drop(tx);

    h.dispatcher
        .serve(&source, SubscribeOptions::default())
        .await
        .unwrap();

    assert_eq!(h.ledger.created_count(), 1);
    assert_eq!(h.ledger.access_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.ledger.balance_reads.load(Ordering::SeqCst), 1);
    assert_eq!(h.step(&step.step_id).await.status, StepStatus::Failed);
}

#[tokio::test]
async fn test_serve_accepts_events_again_once_handler_finishes() {
    let h = Harness::new(VIDEO_WORKFLOW);
    let step = pending("t-1", "generateScript");
    h.seed(vec![step.clone()]).await;

    let (source, tx) = ManualEvents::new();
    let dispatcher = h.dispatcher.clone();
    let server = tokio::spawn(async move {
        dispatcher
            .serve(&source, SubscribeOptions::default())
            .await
    });

    tx.send(event(&step)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.step(&step.step_id).await.status.is_terminal() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("step resolved");
    tokio::time::sleep(Duration::from_millis(100)).await;

    tx.send(event(&step)).await.unwrap();
    drop(tx);
    server.await.unwrap().unwrap();

    assert_eq!(h.ledger.created_count(), 1);
    assert!(h.ledger.logged(LogLevel::Warning, "is Completed, not Pending"));
}
