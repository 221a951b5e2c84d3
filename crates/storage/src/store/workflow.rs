#![forbid(unsafe_code)]

use rusqlite::{TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tl_core::model::TaskStatus;

use super::SqliteStore;
use super::error::StoreError;
use super::now_ms;
use super::requests::{
    ActorContext, ArchiveRequest, CompleteRequest, CreateTaskRequest,
};
use super::types::{WorkflowOpRow, WorkflowState};

/// Multi-step operations keyed by a caller-chosen op id. Re-running a
/// completed op replays its recorded result instead of redoing the steps;
/// that is what makes handoff safe to retry after a crash or timeout.
#[derive(Clone, Copy, Debug)]
pub struct WorkflowService {
    /// A processing row older than this is presumed crashed and reclaimed.
    pub stale_after_ms: i64,
}

impl Default for WorkflowService {
    fn default() -> Self {
        Self {
            stale_after_ms: 10 * 60 * 1_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HandoffInput {
    pub source_task_id: String,
    pub agent: String,
    pub follow_on_title: String,
    pub follow_on_priority: u8,
    pub follow_on_tags: Vec<String>,
    pub actor: ActorContext,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandoffResult {
    pub source_task_id: String,
    pub follow_on_task_id: String,
}

#[derive(Clone, Debug)]
pub struct HandoffOutcome {
    pub result: HandoffResult,
    /// True when this call observed a previously recorded completion.
    pub replayed: bool,
}

/// Hash of the semantic input only; attribution does not participate, so the
/// same logical request from a retried session still replays.
fn handoff_input_hash(input: &HandoffInput) -> String {
    let canonical = json!({
        "source_task_id": input.source_task_id,
        "agent": input.agent,
        "follow_on_title": input.follow_on_title,
        "follow_on_priority": input.follow_on_priority,
        "follow_on_tags": input.follow_on_tags,
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

enum Begin {
    Fresh,
    /// Reclaimed a stale processing row; may carry partial progress.
    Resumed { follow_on_task_id: Option<String> },
    Replay(HandoffResult),
}

impl WorkflowService {
    /// Completes `source` and creates its follow-on task as one idempotent
    /// operation. The follow-on lands in the source's project, ready to
    /// claim. If completing the source fails after the follow-on exists, the
    /// follow-on is archived again before the failure is recorded.
    pub fn run_handoff(
        &self,
        store: &mut SqliteStore,
        op_id: &str,
        input: HandoffInput,
    ) -> Result<HandoffOutcome, StoreError> {
        let input_hash = handoff_input_hash(&input);

        let begin = self.begin(store, op_id, &input_hash)?;
        let resumed_follow_on = match begin {
            Begin::Replay(result) => {
                return Ok(HandoffOutcome {
                    result,
                    replayed: true,
                });
            }
            Begin::Fresh => None,
            Begin::Resumed { follow_on_task_id } => {
                let mut found = None;
                if let Some(id) = follow_on_task_id
                    && store.get_task(&id)?.is_some()
                {
                    found = Some(id);
                }
                found
            }
        };
        let follow_on_task_id = match resumed_follow_on {
            Some(id) => id,
            None => {
                let created = match store.create_task(CreateTaskRequest {
                    title: input.follow_on_title.clone(),
                    project: self.source_project(store, &input.source_task_id)?,
                    parent_id: None,
                    priority: input.follow_on_priority,
                    tags: input.follow_on_tags.clone(),
                    links: Vec::new(),
                    metadata: serde_json::Map::new(),
                    initial_status: Some(TaskStatus::Ready),
                    actor: input.actor.clone(),
                }) {
                    Ok(mutation) => mutation,
                    Err(err) => {
                        self.record_failure(store, op_id, &err.to_string())?;
                        return Err(err);
                    }
                };
                let id = created.task.task_id;
                // Partial progress survives a crash between the two steps.
                self.stash_progress(store, op_id, &id)?;
                id
            }
        };

        if let Err(err) = store.complete_task(CompleteRequest {
            task_id: input.source_task_id.clone(),
            agent: Some(input.agent.clone()),
            actor: input.actor.clone(),
        }) {
            let compensation = store.archive_task(ArchiveRequest {
                task_id: follow_on_task_id.clone(),
                reason: Some("handoff-compensation".to_string()),
                actor: input.actor.clone(),
            });
            if let Err(comp_err) = compensation {
                tracing::warn!(
                    op_id,
                    error = %comp_err,
                    "handoff compensation failed; follow-on task left behind"
                );
            }
            self.record_failure(store, op_id, &err.to_string())?;
            return Err(err);
        }

        let result = HandoffResult {
            source_task_id: input.source_task_id,
            follow_on_task_id,
        };
        self.record_completion(store, op_id, &result)?;
        Ok(HandoffOutcome {
            result,
            replayed: false,
        })
    }

    fn source_project(&self, store: &SqliteStore, task_id: &str) -> Result<String, StoreError> {
        store
            .get_task(task_id)?
            .map(|task| task.project)
            .ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))
    }

    fn begin(
        &self,
        store: &mut SqliteStore,
        op_id: &str,
        input_hash: &str,
    ) -> Result<Begin, StoreError> {
        let now = now_ms();
        let tx = store
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, String, Option<String>, Option<String>, i64)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT input_hash, state, result_json, error_json, updated_at_ms \
                 FROM workflow_ops WHERE op_id=?1",
            )?;
            let mut rows = stmt.query(params![op_id])?;
            match rows.next()? {
                Some(row) => Some((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                )),
                None => None,
            }
        };

        let begin = match existing {
            None => {
                tx.execute(
                    "INSERT INTO workflow_ops(op_id, workflow_name, input_hash, state, \
                        created_at_ms, updated_at_ms) \
                     VALUES (?1, 'handoff', ?2, 'processing', ?3, ?3)",
                    params![op_id, input_hash, now],
                )?;
                Begin::Fresh
            }
            Some((recorded_hash, state_raw, result_json, error_json, updated_at_ms)) => {
                if recorded_hash != input_hash {
                    return Err(StoreError::WorkflowInputMismatch {
                        op_id: op_id.to_string(),
                    });
                }
                let state = WorkflowState::parse(&state_raw).ok_or_else(|| {
                    StoreError::Payload(format!("unknown workflow state: {state_raw}"))
                })?;
                match state {
                    WorkflowState::Completed => {
                        let raw = result_json.ok_or(StoreError::InvalidInput(
                            "completed workflow op has no result",
                        ))?;
                        Begin::Replay(serde_json::from_str(&raw)?)
                    }
                    WorkflowState::Failed => {
                        let message = error_json
                            .as_deref()
                            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                            .and_then(|v| v.get("message").and_then(|m| m.as_str().map(String::from)))
                            .unwrap_or_else(|| "previously failed".to_string());
                        return Err(StoreError::WorkflowFailed {
                            op_id: op_id.to_string(),
                            message,
                        });
                    }
                    WorkflowState::Processing => {
                        if now - updated_at_ms < self.stale_after_ms {
                            return Err(StoreError::WorkflowInProgress {
                                op_id: op_id.to_string(),
                            });
                        }
                        tx.execute(
                            "UPDATE workflow_ops SET updated_at_ms=?2 WHERE op_id=?1",
                            params![op_id, now],
                        )?;
                        let follow_on_task_id = result_json
                            .as_deref()
                            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                            .and_then(|v| {
                                v.get("follow_on_task_id")
                                    .and_then(|id| id.as_str().map(String::from))
                            });
                        Begin::Resumed { follow_on_task_id }
                    }
                }
            }
        };

        tx.commit()?;
        Ok(begin)
    }

    fn stash_progress(
        &self,
        store: &mut SqliteStore,
        op_id: &str,
        follow_on_task_id: &str,
    ) -> Result<(), StoreError> {
        store.conn.execute(
            "UPDATE workflow_ops SET result_json=?2, updated_at_ms=?3 WHERE op_id=?1",
            params![
                op_id,
                json!({ "follow_on_task_id": follow_on_task_id }).to_string(),
                now_ms(),
            ],
        )?;
        Ok(())
    }

    fn record_completion(
        &self,
        store: &mut SqliteStore,
        op_id: &str,
        result: &HandoffResult,
    ) -> Result<(), StoreError> {
        store.conn.execute(
            "UPDATE workflow_ops SET state='completed', result_json=?2, updated_at_ms=?3 \
             WHERE op_id=?1",
            params![op_id, serde_json::to_string(result)?, now_ms()],
        )?;
        Ok(())
    }

    fn record_failure(
        &self,
        store: &mut SqliteStore,
        op_id: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        store.conn.execute(
            "UPDATE workflow_ops SET state='failed', error_json=?2, updated_at_ms=?3 \
             WHERE op_id=?1",
            params![op_id, json!({ "message": message }).to_string(), now_ms()],
        )?;
        Ok(())
    }
}

impl SqliteStore {
    pub fn workflow_op(&self, op_id: &str) -> Result<Option<WorkflowOpRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT op_id, workflow_name, input_hash, state, result_json, error_json, \
                created_at_ms, updated_at_ms \
             FROM workflow_ops WHERE op_id=?1",
        )?;
        let mut rows = stmt.query(params![op_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let state_raw: String = row.get(3)?;
        let result_json: Option<String> = row.get(4)?;
        let error_json: Option<String> = row.get(5)?;
        Ok(Some(WorkflowOpRow {
            op_id: row.get(0)?,
            workflow_name: row.get(1)?,
            input_hash: row.get(2)?,
            state: WorkflowState::parse(&state_raw)
                .ok_or_else(|| StoreError::Payload(format!("unknown workflow state: {state_raw}")))?,
            result: match result_json {
                Some(raw) => Some(serde_json::from_str(&raw)?),
                None => None,
            },
            error: match error_json {
                Some(raw) => Some(serde_json::from_str(&raw)?),
                None => None,
            },
            created_at_ms: row.get(6)?,
            updated_at_ms: row.get(7)?,
        }))
    }
}
