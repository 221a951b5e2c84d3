#![forbid(unsafe_code)]

use rusqlite::{TransactionBehavior, params};
use tl_core::model::{CheckpointRecordedPayload, CommentAddedPayload, EventKind};

use super::super::SqliteStore;
use super::super::error::StoreError;
use super::super::events::EventInput;
use super::super::requests::{AddCheckpointRequest, AddCommentRequest};
use super::super::types::{CheckpointRow, CommentRow, EventEnvelope};
use super::{commit_event_tx, load_task_tx};

impl SqliteStore {
    pub fn add_comment(&mut self, request: AddCommentRequest) -> Result<EventEnvelope, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        load_task_tx(&tx, &request.task_id)?;
        let payload = CommentAddedPayload {
            author: request.actor.author.clone(),
            body: request.body,
        };
        let mut input = EventInput::for_task(
            request.task_id,
            EventKind::CommentAdded,
            serde_json::to_value(&payload)?,
        );
        input.actor = request.actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        tx.commit()?;
        Ok(event)
    }

    /// Durable progress marker agents leave so a successor can resume where
    /// the previous holder stopped.
    pub fn add_checkpoint(
        &mut self,
        request: AddCheckpointRequest,
    ) -> Result<EventEnvelope, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        load_task_tx(&tx, &request.task_id)?;
        let payload = CheckpointRecordedPayload {
            name: request.name,
            data: request.data,
        };
        let mut input = EventInput::for_task(
            request.task_id,
            EventKind::CheckpointRecorded,
            serde_json::to_value(&payload)?,
        );
        input.actor = request.actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        tx.commit()?;
        Ok(event)
    }

    /// Comments in log order, oldest first.
    pub fn comments(&self, task_id: &str) -> Result<Vec<CommentRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT event_seq, task_id, author, body, ts_ms FROM task_comments \
             WHERE task_id=?1 ORDER BY event_seq ASC",
        )?;
        let mut rows = stmt.query(params![task_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(CommentRow {
                event_seq: row.get(0)?,
                task_id: row.get(1)?,
                author: row.get(2)?,
                body: row.get(3)?,
                ts_ms: row.get(4)?,
            });
        }
        Ok(out)
    }

    pub fn checkpoints(&self, task_id: &str) -> Result<Vec<CheckpointRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT event_seq, task_id, name, data_json, ts_ms FROM task_checkpoints \
             WHERE task_id=?1 ORDER BY event_seq ASC",
        )?;
        let mut rows = stmt.query(params![task_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let data_json: String = row.get(3)?;
            out.push(CheckpointRow {
                event_seq: row.get(0)?,
                task_id: row.get(1)?,
                name: row.get(2)?,
                data: serde_json::from_str(&data_json)?,
                ts_ms: row.get(4)?,
            });
        }
        Ok(out)
    }
}
