//! In-memory collaborators for driving the orchestration core in tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use baton_core::ledger::{
    AgentLedger, LogLevel, NotificationSink, PlanLedger, TaskLog, TaskLogEntry,
};
use baton_core::models::{AccessConfig, Artifacts, MediaArtifact, RemoteTask, Step, TaskRequest};
use baton_core::store::{SqliteStepStore, StepStore, StoreResponse};
use baton_core::{
    BatonError, Collaborators, Database, Dispatcher, HandlerRegistry, TaskLogger,
    WorkflowDefinition,
};

/// How a scripted agent answers one task.
#[derive(Clone)]
pub struct Behaviour {
    pub create_status: u16,
    pub progress: Vec<&'static str>,
    pub final_status: &'static str,
    /// Sent after the terminal status; must never be observed.
    pub trailing: Vec<&'static str>,
    pub output: Option<String>,
    pub artifacts: Artifacts,
    /// Answer with one media artifact derived from the query.
    pub echo_media: bool,
    pub malformed: bool,
    /// Accept the task and never report on it.
    pub silent: bool,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            create_status: 201,
            progress: Vec::new(),
            final_status: "Completed",
            trailing: Vec::new(),
            output: Some("done".to_string()),
            artifacts: Artifacts::Empty,
            echo_media: false,
            malformed: false,
            silent: false,
        }
    }
}

impl Behaviour {
    pub fn completes_with(output: &str, artifacts: Artifacts) -> Self {
        Self {
            output: Some(output.to_string()),
            artifacts,
            ..Self::default()
        }
    }

    pub fn fails_with(output: &str) -> Self {
        Self {
            final_status: "Failed",
            output: Some(output.to_string()),
            ..Self::default()
        }
    }
}

pub fn media_url(query: &str) -> String {
    format!("https://cdn.test/{}", query.replace(' ', "_"))
}

/// Scripted agent + plan ledger that records what it was asked to do.
#[derive(Default)]
pub struct FakeLedger {
    by_agent: Mutex<HashMap<String, Behaviour>>,
    by_query: Mutex<HashMap<String, Behaviour>>,
    tasks: Mutex<HashMap<String, RemoteTask>>,
    /// Sinks of silent tasks, held open so the channel never closes.
    parked: Mutex<Vec<NotificationSink>>,
    pub created: Mutex<Vec<(String, TaskRequest)>>,
    pub balances: Mutex<HashMap<String, u64>>,
    pub order_succeeds: Mutex<bool>,
    pub balance_reads: AtomicUsize,
    pub orders: AtomicUsize,
    pub access_fetches: AtomicUsize,
    pub task_fetches: AtomicUsize,
    pub logs: Mutex<Vec<TaskLogEntry>>,
}

impl FakeLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_agent(&self, agent_id: &str, behaviour: Behaviour) {
        self.by_agent
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), behaviour);
    }

    pub fn script_query(&self, query: &str, behaviour: Behaviour) {
        self.by_query
            .lock()
            .unwrap()
            .insert(query.to_string(), behaviour);
    }

    pub fn set_balance(&self, plan_id: &str, balance: u64) {
        self.balances
            .lock()
            .unwrap()
            .insert(plan_id.to_string(), balance);
    }

    pub fn set_order_succeeds(&self, ok: bool) {
        *self.order_succeeds.lock().unwrap() = ok;
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn created_queries(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.query.clone())
            .collect()
    }

    pub fn logged(&self, level: LogLevel, needle: &str) -> bool {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.level == level && e.message.contains(needle))
    }

    fn behaviour_for(&self, agent_id: &str, query: &str) -> Behaviour {
        if let Some(b) = self.by_query.lock().unwrap().get(query) {
            return b.clone();
        }
        self.by_agent
            .lock()
            .unwrap()
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentLedger for FakeLedger {
    async fn get_service_access_config(
        &self,
        plan_id: &str,
        agent_id: &str,
    ) -> Result<AccessConfig, BatonError> {
        self.access_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(AccessConfig {
            plan_id: plan_id.to_string(),
            agent_id: agent_id.to_string(),
            access_token: format!("token-{}", self.access_fetches.load(Ordering::SeqCst)),
            endpoint: None,
        })
    }

    async fn create_task(
        &self,
        agent_id: &str,
        request: &TaskRequest,
        _access: &AccessConfig,
        sink: NotificationSink,
    ) -> Result<StoreResponse, BatonError> {
        let behaviour = self.behaviour_for(agent_id, &request.query);
        let remote_id = {
            let mut created = self.created.lock().unwrap();
            created.push((agent_id.to_string(), request.clone()));
            format!("remote-{}", created.len())
        };

        if !(200..300).contains(&behaviour.create_status) {
            return Ok(StoreResponse::rejected(
                behaviour.create_status,
                json!({ "error": "agent is not accepting tasks" }),
            ));
        }

        let artifacts = if behaviour.echo_media {
            Artifacts::Media(vec![MediaArtifact {
                url: media_url(&request.query),
                mime_type: Some("image/png".to_string()),
                caption: None,
            }])
        } else {
            behaviour.artifacts.clone()
        };
        self.tasks.lock().unwrap().insert(
            remote_id.clone(),
            RemoteTask {
                task_id: remote_id.clone(),
                agent_id: agent_id.to_string(),
                query: request.query.clone(),
                task_status: behaviour.final_status.to_string().into(),
                output: behaviour.output.clone(),
                output_artifacts: artifacts,
                steps: Vec::new(),
            },
        );

        if behaviour.silent {
            self.parked.lock().unwrap().push(sink);
        } else if behaviour.malformed {
            let _ = sink.send(json!({ "unexpected": true }));
        } else {
            let statuses = behaviour
                .progress
                .iter()
                .chain(std::iter::once(&behaviour.final_status))
                .chain(behaviour.trailing.iter());
            for status in statuses {
                // Alternate encodings: adapters deliver objects or JSON strings.
                let payload = json!({ "task_id": remote_id, "task_status": status });
                let _ = sink.send(json!(payload.to_string()));
            }
        }

        Ok(StoreResponse::accepted(json!({ "task": { "task_id": remote_id } })))
    }

    async fn get_task_with_steps(
        &self,
        _agent_id: &str,
        task_id: &str,
        _access: &AccessConfig,
    ) -> Result<RemoteTask, BatonError> {
        self.task_fetches.fetch_add(1, Ordering::SeqCst);
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| BatonError::NotFound(format!("remote task {}", task_id)))
    }
}

#[async_trait]
impl PlanLedger for FakeLedger {
    async fn get_plan_balance(&self, plan_id: &str) -> Result<u64, BatonError> {
        self.balance_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(plan_id)
            .copied()
            .unwrap_or(100))
    }

    async fn order_plan(&self, _plan_id: &str) -> Result<bool, BatonError> {
        self.orders.fetch_add(1, Ordering::SeqCst);
        Ok(*self.order_succeeds.lock().unwrap())
    }
}

#[async_trait]
impl TaskLog for FakeLedger {
    async fn log_task(&self, entry: &TaskLogEntry) -> Result<(), BatonError> {
        self.logs.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

/// Step store that counts writes and otherwise defers to SQLite.
pub struct CountingStore {
    pub inner: SqliteStepStore,
    pub updates: AtomicUsize,
    pub creates: AtomicUsize,
}

#[async_trait]
impl StepStore for CountingStore {
    async fn get_step(&self, step_id: &str) -> Result<Step, BatonError> {
        self.inner.get_step(step_id).await
    }

    async fn create_steps(&self, task_id: &str, steps: Vec<Step>) -> Result<StoreResponse, BatonError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_steps(task_id, steps).await
    }

    async fn update_step(&self, step: &Step) -> Result<StoreResponse, BatonError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_step(step).await
    }
}

pub const VIDEO_WORKFLOW: &str = r#"
name: "Test video"
variables:
  style: "watercolor"
steps:
  - name: generateScript
    agent: script-agent
    plan: plan-script
    prompt: "Write a script for: ${query}"
  - name: generateImages
    kind: fan_out
    items: prompts
    agent: image-agent
    plan: plan-images
    prompt: "${variables.style}: ${item}"
"#;

pub struct Harness {
    pub ledger: Arc<FakeLedger>,
    pub store: Arc<CountingStore>,
    pub deps: Collaborators,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new(workflow_yaml: &str) -> Self {
        Self::with_timeout(workflow_yaml, Duration::from_secs(5))
    }

    pub fn with_timeout(workflow_yaml: &str, timeout: Duration) -> Self {
        let ledger = FakeLedger::new();
        let store = Arc::new(CountingStore {
            inner: SqliteStepStore::new(Database::open_in_memory().expect("in-memory db")),
            updates: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
        });
        let deps = Collaborators {
            steps: store.clone(),
            agents: ledger.clone(),
            plans: ledger.clone(),
            log: TaskLogger::new(ledger.clone()),
        };
        let workflow = WorkflowDefinition::from_yaml(workflow_yaml).expect("workflow parses");
        workflow.validate().expect("workflow is valid");
        let dispatcher =
            Dispatcher::from_parts(deps.clone(), HandlerRegistry::new(workflow), timeout);
        Self {
            ledger,
            store,
            deps,
            dispatcher,
        }
    }

    /// Insert steps directly, bypassing the counters.
    pub async fn seed(&self, steps: Vec<Step>) {
        let task_id = steps[0].task_id.clone();
        let resp = self.store.inner.create_steps(&task_id, steps).await.unwrap();
        assert!(resp.is_success(), "seed rejected: {:?}", resp);
    }

    pub async fn step(&self, step_id: &str) -> Step {
        self.store.inner.get_step(step_id).await.unwrap()
    }

    pub fn updates(&self) -> usize {
        self.store.updates.load(Ordering::SeqCst)
    }
}
