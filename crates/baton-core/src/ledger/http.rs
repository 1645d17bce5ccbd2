//! REST adapter for the task/payment ledger.
//!
//! All calls authenticate with the orchestrator's API key, except the agent
//! task calls, which use the per-delegation access token.
//!
//! ```text
//! GET   /api/v1/steps/{step_id}                         -> Step
//! PUT   /api/v1/steps/{step_id}                         <- Step          (201 = accepted)
//! POST  /api/v1/tasks/{task_id}/steps                   <- {steps: [..]}
//! POST  /api/v1/tasks/{task_id}/logs                    <- TaskLogEntry
//! GET   /api/v1/agents/{agent_id}/steps?status=Pending  -> [Step]
//! GET   /api/v1/plans/{plan_id}/balance                 -> {balance}
//! POST  /api/v1/plans/{plan_id}/order                   -> {success}
//! GET   /api/v1/plans/{plan_id}/agents/{agent_id}/access -> AccessConfig
//! POST  {agent_base}/tasks                              <- TaskRequest
//! GET   {agent_base}/tasks/{task_id}                    -> RemoteTask
//! ```
//!
//! `{agent_base}` is the access config's `endpoint` when the ledger hands one
//! out, otherwise `/api/v1/agents/{agent_id}` on the ledger itself.
//!
//! The ledger has no push channel, so task notifications and step events are
//! produced by background polling tasks.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::LedgerConfig;
use crate::error::BatonError;
use crate::ledger::{
    AgentLedger, EventSource, NotificationSink, PlanLedger, StepEventStream, SubscribeOptions,
    TaskLog, TaskLogEntry,
};
use crate::models::{AccessConfig, RemoteTask, Step, StepEvent, StepStatus, TaskRequest};
use crate::store::{StepStore, StoreResponse};

#[derive(Clone)]
pub struct HttpLedger {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    agent_id: String,
    poll_interval: Duration,
}

impl HttpLedger {
    pub fn new(config: &LedgerConfig) -> Result<Self, BatonError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BatonError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            agent_id: config.agent_id.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(100)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    fn agent_base(&self, agent_id: &str, access: &AccessConfig) -> String {
        match &access.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => self.url(&format!("/agents/{}", agent_id)),
        }
    }

    /// Send a write and keep the raw status and body for the caller to judge.
    async fn send_raw(&self, req: reqwest::RequestBuilder) -> Result<StoreResponse, BatonError> {
        let response = req.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let data = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        Ok(StoreResponse { status, data })
    }

    /// Send a read; any non-2xx reply is an error.
    async fn fetch<T: DeserializeOwned>(
        &self,
        what: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<T, BatonError> {
        let response = req.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BatonError::NotFound(what.to_string()));
        }
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BatonError::Ledger(format!(
                "{} returned {}: {}",
                what, status, text
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| BatonError::Ledger(format!("Unexpected {} payload: {}", what, e)))
    }

    async fn pending_steps(&self, agent_id: &str) -> Result<Vec<Step>, BatonError> {
        let req = self
            .client
            .get(self.url(&format!("/agents/{}/steps", agent_id)))
            .query(&[("status", StepStatus::Pending.as_str())])
            .bearer_auth(&self.api_key);
        self.fetch(&format!("pending steps of agent {}", agent_id), req)
            .await
    }

    /// Poll one remote task, pushing a notification on every status change.
    fn watch_task(
        &self,
        agent_id: String,
        task_id: String,
        access: AccessConfig,
        sink: NotificationSink,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.poll_interval);
            let mut last_status: Option<String> = None;
            loop {
                ticker.tick().await;
                if sink.is_closed() {
                    break;
                }
                let task = match this.get_task_with_steps(&agent_id, &task_id, &access).await {
                    Ok(task) => task,
                    Err(e) => {
                        tracing::warn!("[HttpLedger] Polling task {} failed: {}", task_id, e);
                        continue;
                    }
                };
                let status = task.task_status.as_str().to_string();
                if last_status.as_deref() == Some(status.as_str()) {
                    continue;
                }
                let payload = json!({ "task_id": task.task_id, "task_status": status });
                if sink.send(payload).is_err() {
                    break;
                }
                if task.task_status.is_terminal() {
                    break;
                }
                last_status = Some(status);
            }
            tracing::debug!("[HttpLedger] Stopped watching task {}", task_id);
        });
    }
}

#[async_trait]
impl StepStore for HttpLedger {
    async fn get_step(&self, step_id: &str) -> Result<Step, BatonError> {
        let req = self
            .client
            .get(self.url(&format!("/steps/{}", step_id)))
            .bearer_auth(&self.api_key);
        self.fetch(&format!("step {}", step_id), req).await
    }

    async fn create_steps(&self, task_id: &str, steps: Vec<Step>) -> Result<StoreResponse, BatonError> {
        let req = self
            .client
            .post(self.url(&format!("/tasks/{}/steps", task_id)))
            .bearer_auth(&self.api_key)
            .json(&json!({ "steps": steps }));
        self.send_raw(req).await
    }

    async fn update_step(&self, step: &Step) -> Result<StoreResponse, BatonError> {
        let req = self
            .client
            .put(self.url(&format!("/steps/{}", step.step_id)))
            .bearer_auth(&self.api_key)
            .json(step);
        self.send_raw(req).await
    }
}

#[async_trait]
impl AgentLedger for HttpLedger {
    async fn get_service_access_config(
        &self,
        plan_id: &str,
        agent_id: &str,
    ) -> Result<AccessConfig, BatonError> {
        let req = self
            .client
            .get(self.url(&format!("/plans/{}/agents/{}/access", plan_id, agent_id)))
            .bearer_auth(&self.api_key);
        self.fetch(&format!("access config for agent {}", agent_id), req)
            .await
    }

    async fn create_task(
        &self,
        agent_id: &str,
        request: &TaskRequest,
        access: &AccessConfig,
        sink: NotificationSink,
    ) -> Result<StoreResponse, BatonError> {
        let req = self
            .client
            .post(format!("{}/tasks", self.agent_base(agent_id, access)))
            .bearer_auth(&access.access_token)
            .json(request);
        let resp = self.send_raw(req).await?;

        if resp.is_success() {
            let created = ["/task/task_id", "/task_id", "/task/id"]
                .iter()
                .find_map(|p| resp.data.pointer(p))
                .and_then(|v| v.as_str());
            match created {
                Some(task_id) => {
                    self.watch_task(agent_id.to_string(), task_id.to_string(), access.clone(), sink)
                }
                None => tracing::warn!(
                    "[HttpLedger] Agent {} accepted a task without returning its id; no notifications will follow",
                    agent_id
                ),
            }
        }
        Ok(resp)
    }

    async fn get_task_with_steps(
        &self,
        agent_id: &str,
        task_id: &str,
        access: &AccessConfig,
    ) -> Result<RemoteTask, BatonError> {
        let req = self
            .client
            .get(format!("{}/tasks/{}", self.agent_base(agent_id, access), task_id))
            .bearer_auth(&access.access_token);
        self.fetch(&format!("remote task {}", task_id), req).await
    }
}

#[async_trait]
impl PlanLedger for HttpLedger {
    async fn get_plan_balance(&self, plan_id: &str) -> Result<u64, BatonError> {
        let req = self
            .client
            .get(self.url(&format!("/plans/{}/balance", plan_id)))
            .bearer_auth(&self.api_key);
        let body: serde_json::Value = self.fetch(&format!("balance of plan {}", plan_id), req).await?;
        body.get("balance")
            .and_then(|b| b.as_u64().or_else(|| b.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| BatonError::Ledger(format!("Plan {} balance missing from reply", plan_id)))
    }

    async fn order_plan(&self, plan_id: &str) -> Result<bool, BatonError> {
        let req = self
            .client
            .post(self.url(&format!("/plans/{}/order", plan_id)))
            .bearer_auth(&self.api_key);
        let resp = self.send_raw(req).await?;
        if !resp.is_success() {
            tracing::warn!(
                "[HttpLedger] Order for plan {} refused ({}): {}",
                plan_id,
                resp.status,
                resp.data_text()
            );
            return Ok(false);
        }
        Ok(resp
            .data
            .get("success")
            .and_then(|s| s.as_bool())
            .unwrap_or(true))
    }
}

#[async_trait]
impl EventSource for HttpLedger {
    async fn subscribe(&self, options: SubscribeOptions) -> Result<StepEventStream, BatonError> {
        let agents = if options.join_agent_rooms.is_empty() {
            vec![self.agent_id.clone()]
        } else {
            options.join_agent_rooms.clone()
        };
        if agents.iter().any(|a| a.is_empty()) {
            return Err(BatonError::Config(
                "No agent id to subscribe as; set ledger.agent_id".to_string(),
            ));
        }

        // Pending step ids last observed, per agent. Without a backlog replay,
        // steps already pending count as seen.
        let mut seen: HashMap<String, HashSet<String>> = HashMap::new();
        if !options.get_pending_events_on_subscribe {
            for agent in &agents {
                let ids = self.pending_steps(agent).await?.into_iter().map(|s| s.step_id);
                seen.insert(agent.clone(), ids.collect());
            }
        }

        tracing::info!("[HttpLedger] Polling step events for agents {:?}", agents);
        let (tx, rx) = mpsc::channel(256);
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.poll_interval);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                for agent in &agents {
                    // A failed poll keeps the agent's previous view.
                    let steps = match this.pending_steps(agent).await {
                        Ok(steps) => steps,
                        Err(e) => {
                            tracing::warn!("[HttpLedger] Polling steps of {} failed: {}", agent, e);
                            continue;
                        }
                    };
                    let previous = seen.remove(agent).unwrap_or_default();
                    let mut pending_now = HashSet::with_capacity(steps.len());
                    for step in steps {
                        if !previous.contains(&step.step_id)
                            && tx.send(StepEvent { step_id: step.step_id.clone() }).await.is_err()
                        {
                            return;
                        }
                        pending_now.insert(step.step_id);
                    }
                    seen.insert(agent.clone(), pending_now);
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl TaskLog for HttpLedger {
    async fn log_task(&self, entry: &TaskLogEntry) -> Result<(), BatonError> {
        let req = self
            .client
            .post(self.url(&format!("/tasks/{}/logs", entry.task_id)))
            .bearer_auth(&self.api_key)
            .json(entry);
        let resp = self.send_raw(req).await?;
        if resp.is_success() {
            Ok(())
        } else {
            Err(BatonError::Ledger(format!(
                "Task log rejected ({}): {}",
                resp.status,
                resp.data_text()
            )))
        }
    }
}
