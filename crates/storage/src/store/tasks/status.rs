#![forbid(unsafe_code)]

use rusqlite::TransactionBehavior;
use tl_core::model::{ArchivedPayload, EventKind, StatusChangedPayload, TaskStatus};

use super::super::SqliteStore;
use super::super::error::StoreError;
use super::super::events::EventInput;
use super::super::requests::{ArchiveRequest, SetStatusRequest, TaskMutation};
use super::{commit_event_tx, load_task_tx};

impl SqliteStore {
    /// General status transition, gated by the transition table. Archiving
    /// routes through the dedicated archived event so the terminal timestamp
    /// and reason land in one place.
    pub fn set_status(&mut self, request: SetStatusRequest) -> Result<TaskMutation, StoreError> {
        if request.to == TaskStatus::Archived {
            return self.archive_task(ArchiveRequest {
                task_id: request.task_id,
                reason: request.reason,
                actor: request.actor,
            });
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_task_tx(&tx, &request.task_id)?;
        if !current.status.can_transition_to(request.to) {
            return Err(StoreError::IllegalTransition {
                task_id: request.task_id,
                from: current.status,
                to: request.to,
            });
        }

        // Resuming from blocked keeps the holder attributed; every other
        // transition carries no claim fields.
        let (agent, claimed_at_ms) = if request.to == TaskStatus::InProgress {
            (current.agent.clone(), current.claimed_at_ms)
        } else {
            (None, None)
        };
        let payload = StatusChangedPayload {
            from: current.status,
            to: request.to,
            agent,
            claimed_at_ms,
            lease_until_ms: None,
            reason: request.reason,
        };
        let mut input = EventInput::for_task(
            request.task_id.clone(),
            EventKind::StatusChanged,
            serde_json::to_value(&payload)?,
        );
        input.actor = request.actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        let task = load_task_tx(&tx, &request.task_id)?;
        tx.commit()?;
        Ok(TaskMutation { task, event })
    }

    /// Terminal no matter where the task was, except a second archive.
    pub fn archive_task(&mut self, request: ArchiveRequest) -> Result<TaskMutation, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_task_tx(&tx, &request.task_id)?;
        if current.status == TaskStatus::Archived {
            return Err(StoreError::IllegalTransition {
                task_id: request.task_id,
                from: TaskStatus::Archived,
                to: TaskStatus::Archived,
            });
        }
        let payload = ArchivedPayload {
            from: Some(current.status),
            reason: request.reason,
        };
        let mut input = EventInput::for_task(
            request.task_id.clone(),
            EventKind::Archived,
            serde_json::to_value(&payload)?,
        );
        input.actor = request.actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        let task = load_task_tx(&tx, &request.task_id)?;
        tx.commit()?;
        Ok(TaskMutation { task, event })
    }
}
