#![forbid(unsafe_code)]

use rusqlite::{Transaction, TransactionBehavior, params};
use tl_core::graph::EdgeSet;
use tl_core::model::{DependencyPayload, EventKind};

use super::super::SqliteStore;
use super::super::error::StoreError;
use super::super::events::EventInput;
use super::super::requests::{AddDependencyRequest, DependencyAddOutcome, RemoveDependencyRequest};
use super::super::types::EventEnvelope;
use super::{commit_event_tx, load_task_tx};

fn dependency_edges_tx(tx: &Transaction<'_>) -> Result<EdgeSet, StoreError> {
    let mut stmt = tx.prepare_cached("SELECT task_id, depends_on_id FROM task_dependencies")?;
    let mut rows = stmt.query([])?;
    let mut edges = EdgeSet::new();
    while let Some(row) = rows.next()? {
        edges.insert(row.get(0)?, row.get(1)?);
    }
    Ok(edges)
}

impl SqliteStore {
    /// Adds `task depends-on dep`. The whole-graph reachability check runs in
    /// the same immediate transaction as the append, so two agents cannot
    /// jointly commit a cycle by racing complementary edges.
    pub fn add_dependency(
        &mut self,
        request: AddDependencyRequest,
    ) -> Result<DependencyAddOutcome, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        load_task_tx(&tx, &request.task_id)?;
        load_task_tx(&tx, &request.depends_on_id)?;

        let edges = dependency_edges_tx(&tx)?;
        if edges.contains(&request.task_id, &request.depends_on_id) {
            return Ok(DependencyAddOutcome {
                added: false,
                event: None,
            });
        }
        if edges.reaches(&request.depends_on_id, &request.task_id) {
            return Err(StoreError::DependencyCycle {
                task_id: request.task_id,
                depends_on_id: request.depends_on_id,
            });
        }

        let payload = DependencyPayload {
            depends_on_id: request.depends_on_id,
        };
        let mut input = EventInput::for_task(
            request.task_id,
            EventKind::DependencyAdded,
            serde_json::to_value(&payload)?,
        );
        input.actor = request.actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        tx.commit()?;
        Ok(DependencyAddOutcome {
            added: true,
            event: Some(event),
        })
    }

    /// Removing an absent edge is a no-op that still records the event; the
    /// projector's delete simply affects zero rows.
    pub fn remove_dependency(
        &mut self,
        request: RemoveDependencyRequest,
    ) -> Result<EventEnvelope, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        load_task_tx(&tx, &request.task_id)?;

        let payload = DependencyPayload {
            depends_on_id: request.depends_on_id,
        };
        let mut input = EventInput::for_task(
            request.task_id,
            EventKind::DependencyRemoved,
            serde_json::to_value(&payload)?,
        );
        input.actor = request.actor;
        let event = commit_event_tx(&tx, &self.upcasters, &self.projectors, input)?;
        tx.commit()?;
        Ok(event)
    }

    /// Edge exists in the derived graph right now.
    pub fn has_dependency(&self, task_id: &str, depends_on_id: &str) -> Result<bool, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT 1 FROM task_dependencies WHERE task_id=?1 AND depends_on_id=?2",
        )?;
        Ok(stmt.exists(params![task_id, depends_on_id])?)
    }
}
