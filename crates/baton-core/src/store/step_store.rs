use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, Row};
use tokio::sync::{broadcast, mpsc};

use crate::db::Database;
use crate::error::BatonError;
use crate::ledger::{EventSource, StepEventStream, SubscribeOptions};
use crate::models::{Artifacts, Step, StepEvent, StepStatus};
use crate::store::{StepStore, StoreResponse};

const STEP_COLUMNS: &str = "step_id, task_id, name, predecessor, is_last, status, input_query, \
     input_artifacts, output, output_artifacts, created_at, updated_at";

/// Local step store backed by SQLite.
///
/// Plays the role the remote ledger plays in production: when a step turns
/// terminal, its `Not Ready` successor is flipped to `Pending` (inheriting the
/// predecessor's output as input) and a [`StepEvent`] is broadcast.
#[derive(Clone)]
pub struct SqliteStepStore {
    db: Database,
    events: broadcast::Sender<StepEvent>,
}

impl SqliteStepStore {
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { db, events }
    }

    pub async fn list_by_task(&self, task_id: &str) -> Result<Vec<Step>, BatonError> {
        let task_id = task_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM steps WHERE task_id = ?1 ORDER BY created_at ASC, rowid ASC",
                    STEP_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![task_id], |row| Ok(row_to_step(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn list_pending(&self) -> Result<Vec<Step>, BatonError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM steps WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
                    STEP_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![StepStatus::Pending.as_str()], |row| {
                        Ok(row_to_step(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn find(&self, step_id: &str) -> Result<Option<Step>, BatonError> {
        let id = step_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM steps WHERE step_id = ?1", STEP_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_step(row)),
                )
                .optional()
            })
            .await
    }

    fn publish(&self, step_ids: Vec<String>) {
        for step_id in step_ids {
            // No receivers is fine: nobody is listening yet.
            let _ = self.events.send(StepEvent { step_id });
        }
    }
}

#[async_trait]
impl StepStore for SqliteStepStore {
    async fn get_step(&self, step_id: &str) -> Result<Step, BatonError> {
        self.find(step_id)
            .await?
            .ok_or_else(|| BatonError::NotFound(format!("step {}", step_id)))
    }

    async fn create_steps(&self, task_id: &str, steps: Vec<Step>) -> Result<StoreResponse, BatonError> {
        if let Some(stray) = steps.iter().find(|s| s.task_id != task_id) {
            return Ok(StoreResponse::rejected(
                400,
                serde_json::json!({
                    "error": format!("step {} belongs to task {}, not {}", stray.step_id, stray.task_id, task_id)
                }),
            ));
        }

        let rows = steps.clone();
        let inserted = self
            .db
            .with_conn_async(move |conn| {
                let tx = conn.transaction()?;
                for s in &rows {
                    let exists: bool = tx
                        .query_row(
                            "SELECT 1 FROM steps WHERE step_id = ?1",
                            rusqlite::params![s.step_id],
                            |_| Ok(true),
                        )
                        .optional()?
                        .unwrap_or(false);
                    if exists {
                        return Ok(Err(s.step_id.clone()));
                    }
                    tx.execute(
                        "INSERT INTO steps (step_id, task_id, name, predecessor, is_last, status, \
                         input_query, input_artifacts, output, output_artifacts, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                        rusqlite::params![
                            s.step_id,
                            s.task_id,
                            s.name,
                            s.predecessor,
                            s.is_last as i32,
                            s.status.as_str(),
                            s.input_query,
                            artifacts_to_text(&s.input_artifacts),
                            s.output,
                            artifacts_to_text(&s.output_artifacts),
                            s.created_at.timestamp_millis(),
                            s.updated_at.timestamp_millis(),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(Ok(()))
            })
            .await?;

        if let Err(duplicate) = inserted {
            return Ok(StoreResponse::rejected(
                409,
                serde_json::json!({ "error": format!("step {} already exists", duplicate) }),
            ));
        }

        self.publish(
            steps
                .iter()
                .filter(|s| s.status == StepStatus::Pending)
                .map(|s| s.step_id.clone())
                .collect(),
        );

        Ok(StoreResponse::accepted(serde_json::json!({
            "steps": steps.iter().map(|s| s.step_id.clone()).collect::<Vec<_>>()
        })))
    }

    async fn update_step(&self, step: &Step) -> Result<StoreResponse, BatonError> {
        let Some(current) = self.find(&step.step_id).await? else {
            return Ok(StoreResponse::rejected(
                404,
                serde_json::json!({ "error": format!("step {} not found", step.step_id) }),
            ));
        };
        if current.status.is_terminal() {
            return Ok(StoreResponse::rejected(
                409,
                serde_json::json!({
                    "error": format!("step {} is already {}", step.step_id, current.status)
                }),
            ));
        }

        let s = step.clone();
        let now = Utc::now().timestamp_millis();
        let activated = self
            .db
            .with_conn_async(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE steps SET status = ?1, input_query = ?2, input_artifacts = ?3, \
                     output = ?4, output_artifacts = ?5, updated_at = ?6 WHERE step_id = ?7",
                    rusqlite::params![
                        s.status.as_str(),
                        s.input_query,
                        artifacts_to_text(&s.input_artifacts),
                        s.output,
                        artifacts_to_text(&s.output_artifacts),
                        now,
                        s.step_id,
                    ],
                )?;

                let mut activated = Vec::new();
                if s.status.is_terminal() {
                    let mut stmt = tx.prepare(
                        "SELECT step_id FROM steps WHERE predecessor = ?1 AND status = ?2",
                    )?;
                    let ids = stmt
                        .query_map(
                            rusqlite::params![s.step_id, StepStatus::NotReady.as_str()],
                            |row| row.get::<_, String>(0),
                        )?
                        .collect::<Result<Vec<_>, _>>()?;
                    drop(stmt);

                    for id in ids {
                        tx.execute(
                            "UPDATE steps SET status = ?1, input_query = ?2, input_artifacts = ?3, \
                             updated_at = ?4 WHERE step_id = ?5",
                            rusqlite::params![
                                StepStatus::Pending.as_str(),
                                s.output.clone().unwrap_or_default(),
                                artifacts_to_text(&s.output_artifacts),
                                now,
                                id,
                            ],
                        )?;
                        activated.push(id);
                    }
                }
                tx.commit()?;
                Ok(activated)
            })
            .await?;

        if !activated.is_empty() {
            tracing::debug!(
                "[StepStore] Step {} is {}; activated successors {:?}",
                step.step_id,
                step.status,
                activated
            );
        }
        self.publish(activated);

        Ok(StoreResponse::accepted(serde_json::json!({ "step_id": step.step_id })))
    }
}

#[async_trait]
impl EventSource for SqliteStepStore {
    async fn subscribe(&self, options: SubscribeOptions) -> Result<StepEventStream, BatonError> {
        let (tx, rx) = mpsc::channel(256);
        // Subscribe before reading the backlog so nothing falls in between. A
        // step activated in that gap shows up in both; its live copy is dropped.
        let mut live = self.events.subscribe();

        let backlog = if options.get_pending_events_on_subscribe {
            self.list_pending().await?
        } else {
            Vec::new()
        };

        tokio::spawn(async move {
            let mut replayed: HashSet<String> = HashSet::with_capacity(backlog.len());
            for step in backlog {
                replayed.insert(step.step_id.clone());
                if tx.send(StepEvent { step_id: step.step_id }).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(event) => {
                        if replayed.remove(&event.step_id) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("[StepStore] Subscriber lagged, {} step events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }
}

fn artifacts_to_text(artifacts: &Artifacts) -> String {
    serde_json::to_string(&artifacts.to_values()).unwrap_or_else(|_| "[]".to_string())
}

fn artifacts_from_text(text: &str) -> Artifacts {
    // Stored as a JSON array; anything else is decoded as loose text.
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(raw) => Artifacts::decode(&raw),
        Err(_) => Artifacts::decode(&serde_json::Value::String(text.to_string())),
    }
}

fn row_to_step(row: &Row<'_>) -> Step {
    let is_last_int: i32 = row.get(4).unwrap_or(0);
    let input_artifacts: String = row.get(7).unwrap_or_default();
    let output_artifacts: String = row.get(9).unwrap_or_default();
    let created_ms: i64 = row.get(10).unwrap_or(0);
    let updated_ms: i64 = row.get(11).unwrap_or(0);

    Step {
        step_id: row.get(0).unwrap_or_default(),
        task_id: row.get(1).unwrap_or_default(),
        name: row.get(2).unwrap_or_default(),
        predecessor: row.get(3).unwrap_or(None),
        is_last: is_last_int != 0,
        status: StepStatus::from_str(&row.get::<_, String>(5).unwrap_or_default())
            .unwrap_or(StepStatus::NotReady),
        input_query: row.get(6).unwrap_or_default(),
        input_artifacts: artifacts_from_text(&input_artifacts),
        output: row.get(8).unwrap_or(None),
        output_artifacts: artifacts_from_text(&output_artifacts),
        created_at: chrono::DateTime::from_timestamp_millis(created_ms)
            .unwrap_or_else(|| Utc::now()),
        updated_at: chrono::DateTime::from_timestamp_millis(updated_ms)
            .unwrap_or_else(|| Utc::now()),
    }
}
