#![forbid(unsafe_code)]

mod claim;
mod create;
mod dependency;
mod history;
mod prune;
mod status;

use rusqlite::{Transaction, params};
use tl_core::model::TaskStatus;

use super::error::StoreError;
use super::events::{EventInput, append_event_tx};
use super::projection::{Projector, apply_event_tx};
use super::types::{EventEnvelope, ProjectRow, TaskRow};
use super::upcast::UpcastRegistry;
use super::SqliteStore;

pub(crate) const TASK_COLUMNS: &str = "task_id, title, project, status, parent_id, priority, \
    tags_json, links_json, metadata_json, agent, claimed_at_ms, lease_until_ms, terminal_at_ms, \
    created_at_ms, updated_at_ms, last_event_seq";

/// Append plus synchronous projection, the tail of every command.
pub(crate) fn commit_event_tx(
    tx: &Transaction<'_>,
    upcasters: &UpcastRegistry,
    projectors: &[Box<dyn Projector>],
    input: EventInput,
) -> Result<EventEnvelope, StoreError> {
    let event = append_event_tx(tx, upcasters, input)?;
    apply_event_tx(tx, projectors, &event)?;
    Ok(event)
}

pub(crate) fn read_task(row: &rusqlite::Row<'_>) -> Result<TaskRow, StoreError> {
    let status_raw: String = row.get(3)?;
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Payload(format!("unknown task status: {status_raw}")))?;
    let tags_json: String = row.get(6)?;
    let links_json: String = row.get(7)?;
    let metadata_json: String = row.get(8)?;
    Ok(TaskRow {
        task_id: row.get(0)?,
        title: row.get(1)?,
        project: row.get(2)?,
        status,
        parent_id: row.get(4)?,
        priority: row.get(5)?,
        tags: serde_json::from_str(&tags_json)?,
        links: serde_json::from_str(&links_json)?,
        metadata: serde_json::from_str(&metadata_json)?,
        agent: row.get(9)?,
        claimed_at_ms: row.get(10)?,
        lease_until_ms: row.get(11)?,
        terminal_at_ms: row.get(12)?,
        created_at_ms: row.get(13)?,
        updated_at_ms: row.get(14)?,
        last_event_seq: row.get(15)?,
    })
}

pub(crate) fn load_task_tx(tx: &Transaction<'_>, task_id: &str) -> Result<TaskRow, StoreError> {
    let mut stmt = tx.prepare_cached(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE task_id=?1"
    ))?;
    let mut rows = stmt.query(params![task_id])?;
    match rows.next()? {
        Some(row) => read_task(row),
        None => Err(StoreError::UnknownTask(task_id.to_string())),
    }
}

pub(crate) fn project_exists_tx(tx: &Transaction<'_>, name: &str) -> Result<bool, StoreError> {
    let mut stmt = tx.prepare_cached("SELECT 1 FROM projects WHERE name=?1")?;
    Ok(stmt.exists(params![name])?)
}

impl SqliteStore {
    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_id=?1"
        ))?;
        let mut rows = stmt.query(params![task_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_task(row)?)),
            None => Ok(None),
        }
    }

    /// Tasks in claim order (project, priority desc, oldest first), optionally
    /// narrowed by project and status.
    pub fn list_tasks(
        &self,
        project: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE (?1 IS NULL OR project=?1) AND (?2 IS NULL OR status=?2) \
             ORDER BY project ASC, priority DESC, created_at_ms ASC, task_id ASC"
        ))?;
        let mut rows = stmt.query(params![project, status.map(|s| s.as_str())])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_task(row)?);
        }
        Ok(out)
    }

    pub fn list_children(&self, parent_id: &str) -> Result<Vec<TaskRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id=?1 \
             ORDER BY created_at_ms ASC, task_id ASC"
        ))?;
        let mut rows = stmt.query(params![parent_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_task(row)?);
        }
        Ok(out)
    }

    /// In-progress tasks whose lease expired before `now_ms`. Read-only by
    /// contract; recovering one is a separate steal or release decision.
    pub fn list_stuck_tasks(&self, now_ms: i64) -> Result<Vec<TaskRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status='in_progress' AND lease_until_ms IS NOT NULL AND lease_until_ms<?1 \
             ORDER BY lease_until_ms ASC, task_id ASC"
        ))?;
        let mut rows = stmt.query(params![now_ms])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_task(row)?);
        }
        Ok(out)
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectRow>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT name, created_at_ms FROM projects ORDER BY name ASC")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ProjectRow {
                name: row.get(0)?,
                created_at_ms: row.get(1)?,
            });
        }
        Ok(out)
    }

    pub fn dependencies_of(&self, task_id: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT depends_on_id FROM task_dependencies WHERE task_id=?1 ORDER BY depends_on_id",
        )?;
        let mut rows = stmt.query(params![task_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get::<_, String>(0)?);
        }
        Ok(out)
    }
}
