#![forbid(unsafe_code)]

use rusqlite::{Transaction, TransactionBehavior, params};
use tl_core::model::{EventKind, StatusChangedPayload, TaskStatus};

use super::super::SqliteStore;
use super::super::error::StoreError;
use super::super::events::EventInput;
use super::super::now_ms;
use super::super::requests::{
    ClaimNextRequest, ClaimRequest, CompleteRequest, ReleaseRequest, StealMode, StealRequest,
    TaskMutation,
};
use super::super::types::TaskRow;
use super::{TASK_COLUMNS, commit_event_tx, load_task_tx, read_task};

/// Claim-order candidate scan: ready, leaf-only, every dependency done.
/// Tag filtering happens in the caller because tags live in JSON.
fn claim_candidates_tx(
    tx: &Transaction<'_>,
    project: Option<&str>,
    parent: Option<&str>,
) -> Result<Vec<TaskRow>, StoreError> {
    let mut stmt = tx.prepare_cached(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks t \
         WHERE t.status='ready' \
           AND (?1 IS NULL OR t.project=?1) \
           AND (?2 IS NULL OR t.parent_id=?2) \
           AND NOT EXISTS (SELECT 1 FROM tasks c WHERE c.parent_id=t.task_id) \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies d \
               LEFT JOIN tasks dt ON dt.task_id=d.depends_on_id \
               WHERE d.task_id=t.task_id AND (dt.task_id IS NULL OR dt.status!='done')) \
         ORDER BY t.project ASC, t.priority DESC, t.created_at_ms ASC, t.task_id ASC"
    ))?;
    let mut rows = stmt.query(params![project, parent])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_task(row)?);
    }
    Ok(out)
}

impl SqliteStore {
    /// Claims a specific ready task for an agent. The read-check-append runs
    /// under an immediate transaction, so of N racing claimants exactly one
    /// sees `ready`; the rest get `NotClaimable` with the winner's status.
    pub fn claim_task(&mut self, request: ClaimRequest) -> Result<TaskMutation, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_task_tx(&tx, &request.task_id)?;
        if current.status != TaskStatus::Ready {
            return Err(StoreError::NotClaimable {
                task_id: request.task_id,
                status: current.status,
            });
        }

        let now = now_ms();
        let payload = StatusChangedPayload {
            from: TaskStatus::Ready,
            to: TaskStatus::InProgress,
            agent: Some(request.agent),
            claimed_at_ms: Some(now),
            lease_until_ms: request.lease_ttl_ms.map(|ttl| now + ttl),
            reason: Some("claim".to_string()),
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

    /// Claims the best eligible task in claim order, or `None` when the queue
    /// has nothing eligible. Eligibility: ready, all dependencies done, no
    /// subtasks (parents are claimed through their children), and carrying
    /// every requested tag.
    pub fn claim_next(
        &mut self,
        request: ClaimNextRequest,
    ) -> Result<Option<TaskMutation>, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidates =
            claim_candidates_tx(&tx, request.project.as_deref(), request.parent.as_deref())?;
        let Some(chosen) = candidates.into_iter().find(|task| {
            request
                .tags
                .iter()
                .all(|wanted| task.tags.iter().any(|tag| tag == wanted))
        }) else {
            return Ok(None);
        };

        let now = now_ms();
        let payload = StatusChangedPayload {
            from: TaskStatus::Ready,
            to: TaskStatus::InProgress,
            agent: Some(request.agent),
            claimed_at_ms: Some(now),
            lease_until_ms: request.lease_ttl_ms.map(|ttl| now + ttl),
            reason: Some("claim".to_string()),
        };
        let mut input = EventInput::for_task(
            chosen.task_id.clone(),
            EventKind::StatusChanged,
            serde_json::to_value(&payload)?,
        );
        input.actor = request.actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        let task = load_task_tx(&tx, &chosen.task_id)?;
        tx.commit()?;
        Ok(Some(TaskMutation { task, event }))
    }

    /// Reassigns an in-progress task to a new agent. `IfExpired` refuses
    /// unless the current lease has lapsed; `Force` always takes over. The
    /// takeover stays in `in_progress`, recorded as a status-changed event
    /// with identical endpoints.
    pub fn steal_task(&mut self, request: StealRequest) -> Result<TaskMutation, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_task_tx(&tx, &request.task_id)?;
        if current.status != TaskStatus::InProgress {
            return Err(StoreError::NotClaimable {
                task_id: request.task_id,
                status: current.status,
            });
        }

        let now = now_ms();
        if request.mode == StealMode::IfExpired {
            let expired = current.lease_until_ms.is_some_and(|lease| lease < now);
            if !expired {
                return Err(StoreError::NotStealable {
                    task_id: request.task_id,
                    holder: current.agent,
                    lease_until_ms: current.lease_until_ms,
                });
            }
        }

        let payload = StatusChangedPayload {
            from: TaskStatus::InProgress,
            to: TaskStatus::InProgress,
            agent: Some(request.new_agent),
            claimed_at_ms: Some(now),
            lease_until_ms: request.lease_ttl_ms.map(|ttl| now + ttl),
            reason: Some("steal".to_string()),
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

    /// Puts an in-progress task back in the queue and clears the claim.
    pub fn release_task(&mut self, request: ReleaseRequest) -> Result<TaskMutation, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_task_tx(&tx, &request.task_id)?;
        if current.status != TaskStatus::InProgress {
            return Err(StoreError::IllegalTransition {
                task_id: request.task_id,
                from: current.status,
                to: TaskStatus::Ready,
            });
        }
        if let Some(agent) = request.agent.as_deref()
            && current.agent.as_deref() != Some(agent)
        {
            return Err(StoreError::NotHolder {
                task_id: request.task_id,
                holder: current.agent,
            });
        }

        let payload = StatusChangedPayload {
            from: TaskStatus::InProgress,
            to: TaskStatus::Ready,
            agent: None,
            claimed_at_ms: None,
            lease_until_ms: None,
            reason: Some("release".to_string()),
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

    pub fn complete_task(&mut self, request: CompleteRequest) -> Result<TaskMutation, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = load_task_tx(&tx, &request.task_id)?;
        if current.status != TaskStatus::InProgress {
            return Err(StoreError::IllegalTransition {
                task_id: request.task_id,
                from: current.status,
                to: TaskStatus::Done,
            });
        }
        if let Some(agent) = request.agent.as_deref()
            && current.agent.as_deref() != Some(agent)
        {
            return Err(StoreError::NotHolder {
                task_id: request.task_id,
                holder: current.agent,
            });
        }

        let payload = StatusChangedPayload {
            from: TaskStatus::InProgress,
            to: TaskStatus::Done,
            agent: current.agent.clone(),
            claimed_at_ms: current.claimed_at_ms,
            lease_until_ms: None,
            reason: Some("complete".to_string()),
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
}
