#![forbid(unsafe_code)]

use rusqlite::{Transaction, TransactionBehavior, params};
use tl_core::model::TaskStatus;

use super::super::SqliteStore;
use super::super::error::StoreError;
use super::super::requests::{PrunableTask, PruneReport};

/// Terminal before the cutoff, and not the parent of any task that would
/// survive the prune. Parents outlive their slowest child.
const PRUNABLE_SQL: &str = "SELECT task_id, title, status, terminal_at_ms FROM tasks t \
     WHERE t.terminal_at_ms IS NOT NULL AND t.terminal_at_ms < ?1 \
       AND NOT EXISTS ( \
           SELECT 1 FROM tasks c WHERE c.parent_id = t.task_id \
             AND (c.terminal_at_ms IS NULL OR c.terminal_at_ms >= ?1)) \
     ORDER BY t.terminal_at_ms ASC, t.task_id ASC";

fn prunable_tx(tx: &Transaction<'_>, cutoff_ms: i64) -> Result<Vec<PrunableTask>, StoreError> {
    let mut stmt = tx.prepare_cached(PRUNABLE_SQL)?;
    let mut rows = stmt.query(params![cutoff_ms])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let status_raw: String = row.get(2)?;
        out.push(PrunableTask {
            task_id: row.get(0)?,
            title: row.get(1)?,
            status: TaskStatus::parse(&status_raw)
                .ok_or_else(|| StoreError::Payload(format!("unknown task status: {status_raw}")))?,
            terminal_at_ms: row.get(3)?,
        });
    }
    Ok(out)
}

impl SqliteStore {
    /// Dry run of [`SqliteStore::prune_eligible`].
    pub fn preview_prunable_tasks(
        &mut self,
        cutoff_ms: i64,
    ) -> Result<Vec<PrunableTask>, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = prunable_tx(&tx, cutoff_ms)?;
        tx.commit()?;
        Ok(out)
    }

    /// Deletes eligible tasks along with their events. This is the one
    /// operation that shrinks the log; after it, a rebuild reproduces the
    /// post-prune state, not the pre-prune one. Dangling dependency edges in
    /// either direction are dropped with the task.
    pub fn prune_eligible(&mut self, cutoff_ms: i64) -> Result<PruneReport, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let victims = prunable_tx(&tx, cutoff_ms)?;

        let mut events_deleted = 0usize;
        let mut pruned_task_ids = Vec::with_capacity(victims.len());
        for victim in &victims {
            let id = victim.task_id.as_str();
            events_deleted += tx.execute("DELETE FROM events WHERE task_id=?1", params![id])?;
            tx.execute("DELETE FROM tasks WHERE task_id=?1", params![id])?;
            tx.execute(
                "DELETE FROM task_dependencies WHERE task_id=?1 OR depends_on_id=?1",
                params![id],
            )?;
            tx.execute("DELETE FROM task_tags WHERE task_id=?1", params![id])?;
            tx.execute("DELETE FROM task_comments WHERE task_id=?1", params![id])?;
            tx.execute("DELETE FROM task_checkpoints WHERE task_id=?1", params![id])?;
            tx.execute("DELETE FROM task_search WHERE task_id=?1", params![id])?;
            pruned_task_ids.push(victim.task_id.clone());
        }

        tx.commit()?;
        Ok(PruneReport {
            pruned_task_ids,
            events_deleted,
        })
    }
}
