#![forbid(unsafe_code)]

use rusqlite::{OptionalExtension, Transaction, params};
use tl_core::model::{
    ArchivedPayload, CheckpointRecordedPayload, CommentAddedPayload, CreatedPayload, EventKind,
    MovedPayload, ProjectCreatedPayload, ProjectDeletedPayload, ProjectRenamedPayload,
    StatusChangedPayload, TaskStatus, UpdatedPayload,
};

use super::StoreError;
use super::projection::Projector;
use super::types::EventEnvelope;

/// Registration order is load-bearing: tasks before dependencies and search,
/// because both read the `tasks` table the task projector maintains.
pub(crate) fn registry() -> Vec<Box<dyn Projector>> {
    vec![
        Box::new(ProjectProjector),
        Box::new(TaskProjector),
        Box::new(DependencyProjector),
        Box::new(TagProjector),
        Box::new(HistoryProjector),
        Box::new(SearchProjector),
    ]
}

fn payload<T: serde::de::DeserializeOwned>(event: &EventEnvelope) -> Result<T, StoreError> {
    serde_json::from_value(event.data.clone()).map_err(|err| {
        StoreError::Payload(format!(
            "{} payload at seq {}: {err}",
            event.kind.as_str(),
            event.seq
        ))
    })
}

fn task_id(event: &EventEnvelope) -> Result<&str, StoreError> {
    event
        .task_id
        .as_deref()
        .ok_or(StoreError::InvalidInput("event is missing a task_id"))
}

struct ProjectProjector;

impl Projector for ProjectProjector {
    fn name(&self) -> &'static str {
        "projects"
    }

    fn apply(&self, tx: &Transaction<'_>, event: &EventEnvelope) -> Result<(), StoreError> {
        match event.kind {
            EventKind::ProjectCreated => {
                let data: ProjectCreatedPayload = payload(event)?;
                tx.execute(
                    "INSERT OR IGNORE INTO projects(name, created_at_ms) VALUES (?1, ?2)",
                    params![data.name, event.ts_ms],
                )?;
            }
            EventKind::ProjectRenamed => {
                let data: ProjectRenamedPayload = payload(event)?;
                tx.execute(
                    "INSERT OR IGNORE INTO projects(name, created_at_ms) \
                     VALUES (?2, COALESCE((SELECT created_at_ms FROM projects WHERE name=?1), ?3))",
                    params![data.from, data.to, event.ts_ms],
                )?;
                tx.execute("DELETE FROM projects WHERE name=?1", params![data.from])?;
            }
            EventKind::ProjectDeleted => {
                let data: ProjectDeletedPayload = payload(event)?;
                tx.execute("DELETE FROM projects WHERE name=?1", params![data.name])?;
            }
            _ => {}
        }
        Ok(())
    }

    fn reset(&self, tx: &Transaction<'_>) -> Result<(), StoreError> {
        tx.execute("DELETE FROM projects", [])?;
        Ok(())
    }
}

struct TaskProjector;

impl Projector for TaskProjector {
    fn name(&self) -> &'static str {
        "tasks"
    }

    fn apply(&self, tx: &Transaction<'_>, event: &EventEnvelope) -> Result<(), StoreError> {
        match event.kind {
            EventKind::Created => {
                let data: CreatedPayload = payload(event)?;
                let status = data.status.unwrap_or(TaskStatus::Backlog);
                tx.execute(
                    "INSERT OR REPLACE INTO tasks(task_id, title, project, status, parent_id, \
                        priority, tags_json, links_json, metadata_json, agent, claimed_at_ms, \
                        lease_until_ms, terminal_at_ms, created_at_ms, updated_at_ms, \
                        last_event_seq) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, NULL, NULL, \
                        ?10, ?10, ?11)",
                    params![
                        task_id(event)?,
                        data.title,
                        data.project,
                        status.as_str(),
                        data.parent_id,
                        data.priority,
                        serde_json::to_string(&data.tags)?,
                        serde_json::to_string(&data.links)?,
                        serde_json::to_string(&data.metadata)?,
                        event.ts_ms,
                        event.seq,
                    ],
                )?;
            }
            EventKind::StatusChanged => {
                let data: StatusChangedPayload = payload(event)?;
                let id = task_id(event)?;
                match data.to {
                    TaskStatus::InProgress => {
                        // Claims and steals carry the holder in the payload.
                        tx.execute(
                            "UPDATE tasks SET status=?2, agent=?3, claimed_at_ms=?4, \
                                lease_until_ms=?5, updated_at_ms=?6, last_event_seq=?7 \
                             WHERE task_id=?1",
                            params![
                                id,
                                data.to.as_str(),
                                data.agent,
                                data.claimed_at_ms,
                                data.lease_until_ms,
                                event.ts_ms,
                                event.seq,
                            ],
                        )?;
                    }
                    TaskStatus::Ready => {
                        tx.execute(
                            "UPDATE tasks SET status=?2, agent=NULL, claimed_at_ms=NULL, \
                                lease_until_ms=NULL, updated_at_ms=?3, last_event_seq=?4 \
                             WHERE task_id=?1",
                            params![id, data.to.as_str(), event.ts_ms, event.seq],
                        )?;
                    }
                    TaskStatus::Done => {
                        tx.execute(
                            "UPDATE tasks SET status=?2, lease_until_ms=NULL, terminal_at_ms=?3, \
                                updated_at_ms=?3, last_event_seq=?4 \
                             WHERE task_id=?1",
                            params![id, data.to.as_str(), event.ts_ms, event.seq],
                        )?;
                    }
                    TaskStatus::Blocked => {
                        // The holder stays attributed while the lease is void.
                        tx.execute(
                            "UPDATE tasks SET status=?2, lease_until_ms=NULL, updated_at_ms=?3, \
                                last_event_seq=?4 \
                             WHERE task_id=?1",
                            params![id, data.to.as_str(), event.ts_ms, event.seq],
                        )?;
                    }
                    TaskStatus::Backlog | TaskStatus::Archived => {
                        tx.execute(
                            "UPDATE tasks SET status=?2, updated_at_ms=?3, last_event_seq=?4 \
                             WHERE task_id=?1",
                            params![id, data.to.as_str(), event.ts_ms, event.seq],
                        )?;
                    }
                }
            }
            EventKind::Archived => {
                let _: ArchivedPayload = payload(event)?;
                tx.execute(
                    "UPDATE tasks SET status='archived', lease_until_ms=NULL, terminal_at_ms=?2, \
                        updated_at_ms=?2, last_event_seq=?3 \
                     WHERE task_id=?1",
                    params![task_id(event)?, event.ts_ms, event.seq],
                )?;
            }
            EventKind::Moved => {
                let data: MovedPayload = payload(event)?;
                tx.execute(
                    "UPDATE tasks SET project=?2, updated_at_ms=?3, last_event_seq=?4 \
                     WHERE task_id=?1",
                    params![task_id(event)?, data.to_project, event.ts_ms, event.seq],
                )?;
            }
            EventKind::Updated => {
                let data: UpdatedPayload = payload(event)?;
                let id = task_id(event)?;
                if let Some(title) = data.title {
                    tx.execute(
                        "UPDATE tasks SET title=?2 WHERE task_id=?1",
                        params![id, title],
                    )?;
                }
                if let Some(priority) = data.priority {
                    tx.execute(
                        "UPDATE tasks SET priority=?2 WHERE task_id=?1",
                        params![id, priority],
                    )?;
                }
                if let Some(tags) = data.tags {
                    tx.execute(
                        "UPDATE tasks SET tags_json=?2 WHERE task_id=?1",
                        params![id, serde_json::to_string(&tags)?],
                    )?;
                }
                if let Some(links) = data.links {
                    tx.execute(
                        "UPDATE tasks SET links_json=?2 WHERE task_id=?1",
                        params![id, serde_json::to_string(&links)?],
                    )?;
                }
                if let Some(metadata) = data.metadata {
                    tx.execute(
                        "UPDATE tasks SET metadata_json=?2 WHERE task_id=?1",
                        params![id, serde_json::to_string(&metadata)?],
                    )?;
                }
                tx.execute(
                    "UPDATE tasks SET updated_at_ms=?2, last_event_seq=?3 WHERE task_id=?1",
                    params![id, event.ts_ms, event.seq],
                )?;
            }
            EventKind::ProjectRenamed => {
                let data: ProjectRenamedPayload = payload(event)?;
                tx.execute(
                    "UPDATE tasks SET project=?2 WHERE project=?1",
                    params![data.from, data.to],
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    fn reset(&self, tx: &Transaction<'_>) -> Result<(), StoreError> {
        tx.execute("DELETE FROM tasks", [])?;
        Ok(())
    }
}

struct DependencyProjector;

impl Projector for DependencyProjector {
    fn name(&self) -> &'static str {
        "dependencies"
    }

    fn apply(&self, tx: &Transaction<'_>, event: &EventEnvelope) -> Result<(), StoreError> {
        match event.kind {
            EventKind::DependencyAdded => {
                let data: tl_core::model::DependencyPayload = payload(event)?;
                // Edges pointing at pruned tasks stay out of the graph when
                // the log is replayed.
                tx.execute(
                    "INSERT OR IGNORE INTO task_dependencies(task_id, depends_on_id, created_at_ms) \
                     SELECT ?1, ?2, ?3 \
                     WHERE EXISTS (SELECT 1 FROM tasks WHERE task_id=?1) \
                       AND EXISTS (SELECT 1 FROM tasks WHERE task_id=?2)",
                    params![task_id(event)?, data.depends_on_id, event.ts_ms],
                )?;
            }
            EventKind::DependencyRemoved => {
                let data: tl_core::model::DependencyPayload = payload(event)?;
                tx.execute(
                    "DELETE FROM task_dependencies WHERE task_id=?1 AND depends_on_id=?2",
                    params![task_id(event)?, data.depends_on_id],
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    fn reset(&self, tx: &Transaction<'_>) -> Result<(), StoreError> {
        tx.execute("DELETE FROM task_dependencies", [])?;
        Ok(())
    }
}

struct TagProjector;

impl Projector for TagProjector {
    fn name(&self) -> &'static str {
        "tags"
    }

    fn apply(&self, tx: &Transaction<'_>, event: &EventEnvelope) -> Result<(), StoreError> {
        let tags: Option<Vec<String>> = match event.kind {
            EventKind::Created => Some(payload::<CreatedPayload>(event)?.tags),
            EventKind::Updated => payload::<UpdatedPayload>(event)?.tags,
            _ => None,
        };
        if let Some(tags) = tags {
            let id = task_id(event)?;
            tx.execute("DELETE FROM task_tags WHERE task_id=?1", params![id])?;
            let mut insert =
                tx.prepare_cached("INSERT OR IGNORE INTO task_tags(task_id, tag) VALUES (?1, ?2)")?;
            for tag in tags {
                insert.execute(params![id, tag])?;
            }
        }
        Ok(())
    }

    fn reset(&self, tx: &Transaction<'_>) -> Result<(), StoreError> {
        tx.execute("DELETE FROM task_tags", [])?;
        Ok(())
    }
}

struct HistoryProjector;

impl Projector for HistoryProjector {
    fn name(&self) -> &'static str {
        "history"
    }

    fn apply(&self, tx: &Transaction<'_>, event: &EventEnvelope) -> Result<(), StoreError> {
        match event.kind {
            EventKind::CommentAdded => {
                let data: CommentAddedPayload = payload(event)?;
                tx.execute(
                    "INSERT OR REPLACE INTO task_comments(event_seq, task_id, author, body, ts_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        event.seq,
                        task_id(event)?,
                        data.author.as_deref().or(event.author.as_deref()),
                        data.body,
                        event.ts_ms,
                    ],
                )?;
            }
            EventKind::CheckpointRecorded => {
                let data: CheckpointRecordedPayload = payload(event)?;
                tx.execute(
                    "INSERT OR REPLACE INTO task_checkpoints(event_seq, task_id, name, data_json, \
                        ts_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        event.seq,
                        task_id(event)?,
                        data.name,
                        serde_json::to_string(&data.data)?,
                        event.ts_ms,
                    ],
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    fn reset(&self, tx: &Transaction<'_>) -> Result<(), StoreError> {
        tx.execute("DELETE FROM task_comments", [])?;
        tx.execute("DELETE FROM task_checkpoints", [])?;
        Ok(())
    }
}

/// Maintains a lowercase title-plus-tags haystack per task. Reads the rows
/// the task and tag projectors wrote for this same event, which is why it
/// registers after both.
struct SearchProjector;

impl Projector for SearchProjector {
    fn name(&self) -> &'static str {
        "search"
    }

    fn apply(&self, tx: &Transaction<'_>, event: &EventEnvelope) -> Result<(), StoreError> {
        if !matches!(event.kind, EventKind::Created | EventKind::Updated) {
            return Ok(());
        }
        let id = task_id(event)?;
        let title: Option<String> = tx
            .query_row(
                "SELECT title FROM tasks WHERE task_id=?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(title) = title else {
            return Ok(());
        };

        let mut haystack = title.to_lowercase();
        let mut stmt =
            tx.prepare_cached("SELECT tag FROM task_tags WHERE task_id=?1 ORDER BY tag")?;
        let mut rows = stmt.query(params![id])?;
        while let Some(row) = rows.next()? {
            haystack.push(' ');
            haystack.push_str(&row.get::<_, String>(0)?.to_lowercase());
        }

        tx.execute(
            "INSERT OR REPLACE INTO task_search(task_id, haystack) VALUES (?1, ?2)",
            params![id, haystack],
        )?;
        Ok(())
    }

    fn reset(&self, tx: &Transaction<'_>) -> Result<(), StoreError> {
        tx.execute("DELETE FROM task_search", [])?;
        Ok(())
    }
}

impl super::SqliteStore {
    /// Case-insensitive substring search over the derived title/tags haystack.
    pub fn search_tasks(&self, query: &str) -> Result<Vec<String>, StoreError> {
        let needle = format!("%{}%", query.to_lowercase());
        let mut stmt = self
            .conn
            .prepare("SELECT task_id FROM task_search WHERE haystack LIKE ?1 ORDER BY task_id")?;
        let mut rows = stmt.query(params![needle])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get::<_, String>(0)?);
        }
        Ok(out)
    }
}
