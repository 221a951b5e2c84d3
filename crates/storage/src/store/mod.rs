#![forbid(unsafe_code)]

mod error;
mod events;
mod lock;
mod outbox;
mod projection;
mod projectors;
mod requests;
mod sync;
mod tasks;
mod types;
mod upcast;
mod workflow;

pub use error::StoreError;
pub use events::{AppendOutcome, EventInput, EventQuery};
pub use lock::{DatabaseLock, LockGuard, LockRecord};
pub use outbox::{
    DeliveryError, DrainConfig, DrainReport, HookDelivery, HookDrainService, UreqTransport,
    WebhookTransport,
};
pub use projection::Projector;
pub use requests::*;
pub use sync::{
    ConflictStrategy, ReplicaTransport, SyncFrame, SyncMode, SyncPolicy, SyncReport,
    TransportError,
};
pub use types::*;
pub use workflow::{HandoffInput, HandoffOutcome, HandoffResult, WorkflowService};

use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use upcast::UpcastRegistry;

pub const DB_FILE_NAME: &str = "taskledger.db";
const STORE_SCHEMA_VERSION: i64 = 1;

pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
    projectors: Vec<Box<dyn projection::Projector>>,
    upcasters: UpcastRegistry,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("storage_dir", &self.storage_dir)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let db_path = storage_dir.join(DB_FILE_NAME);
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        preflight_gate(&conn)?;
        install_schema(&conn)?;
        ensure_instance_identity(&conn)?;

        Ok(Self {
            conn,
            storage_dir,
            projectors: projectors::registry(),
            upcasters: upcast::registry(),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Stable per-replica identity, minted on first open.
    pub fn instance_id(&self) -> Result<String, StoreError> {
        meta_get(&self.conn, "instance_id")?
            .ok_or(StoreError::InvalidInput("instance_id missing from meta"))
    }

    /// Storage-level integrity check. A failure here is fatal; the recommended
    /// recovery is `rebuild_all_projections` on a restored copy of the log.
    pub fn integrity_check(&self) -> Result<(), StoreError> {
        let verdict: String =
            self.conn
                .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if verdict == "ok" {
            Ok(())
        } else {
            Err(StoreError::IntegrityCheckFailed(verdict))
        }
    }

    pub fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        meta_get(&self.conn, key)
    }

    pub fn meta_set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        meta_set(&self.conn, key, value)
    }
}

fn preflight_gate(conn: &Connection) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let mut rows = stmt.query([])?;
    let mut tables = BTreeSet::new();
    while let Some(row) = rows.next()? {
        tables.insert(row.get::<_, String>(0)?);
    }

    if tables.is_empty() {
        return Ok(());
    }

    let required: BTreeSet<&str> = [
        "meta",
        "events",
        "projection_state",
        "projects",
        "tasks",
        "task_dependencies",
        "task_tags",
        "task_comments",
        "task_checkpoints",
        "task_search",
        "hook_outbox",
        "workflow_ops",
    ]
    .into_iter()
    .collect();

    if tables.iter().any(|table| !required.contains(table.as_str())) {
        return Err(StoreError::InvalidInput(
            "RESET_REQUIRED: unsupported tables detected",
        ));
    }
    for table in required {
        if !tables.contains(table) {
            return Err(StoreError::InvalidInput(
                "RESET_REQUIRED: required table is missing",
            ));
        }
    }

    let version = meta_get(conn, "store_schema_version")?
        .and_then(|raw| raw.parse::<i64>().ok());
    match version {
        Some(v) if v == STORE_SCHEMA_VERSION => Ok(()),
        Some(_) => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: schema version mismatch",
        )),
        None => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: schema version row is missing",
        )),
    }
}

fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;

        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS events (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          event_id TEXT NOT NULL UNIQUE,
          task_id TEXT,
          type TEXT NOT NULL,
          data_json TEXT NOT NULL,
          author TEXT,
          agent_id TEXT,
          session_id TEXT,
          correlation_id TEXT,
          causation_id TEXT,
          schema_version INTEGER NOT NULL,
          ts_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_task_seq ON events(task_id, seq);

        CREATE TABLE IF NOT EXISTS projection_state (
          projector TEXT PRIMARY KEY,
          last_seq INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS projects (
          name TEXT PRIMARY KEY,
          created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
          task_id TEXT PRIMARY KEY,
          title TEXT NOT NULL,
          project TEXT NOT NULL,
          status TEXT NOT NULL,
          parent_id TEXT,
          priority INTEGER NOT NULL,
          tags_json TEXT NOT NULL,
          links_json TEXT NOT NULL,
          metadata_json TEXT NOT NULL,
          agent TEXT,
          claimed_at_ms INTEGER,
          lease_until_ms INTEGER,
          terminal_at_ms INTEGER,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          last_event_seq INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_claim_order
          ON tasks(status, project, priority, created_at_ms, task_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);

        CREATE TABLE IF NOT EXISTS task_dependencies (
          task_id TEXT NOT NULL,
          depends_on_id TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          PRIMARY KEY(task_id, depends_on_id)
        );

        CREATE TABLE IF NOT EXISTS task_tags (
          task_id TEXT NOT NULL,
          tag TEXT NOT NULL,
          PRIMARY KEY(task_id, tag)
        );

        CREATE TABLE IF NOT EXISTS task_comments (
          event_seq INTEGER PRIMARY KEY,
          task_id TEXT NOT NULL,
          author TEXT,
          body TEXT NOT NULL,
          ts_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_comments_task ON task_comments(task_id, event_seq);

        CREATE TABLE IF NOT EXISTS task_checkpoints (
          event_seq INTEGER PRIMARY KEY,
          task_id TEXT NOT NULL,
          name TEXT NOT NULL,
          data_json TEXT NOT NULL,
          ts_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_checkpoints_task ON task_checkpoints(task_id, event_seq);

        CREATE TABLE IF NOT EXISTS task_search (
          task_id TEXT PRIMARY KEY,
          haystack TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS hook_outbox (
          id TEXT PRIMARY KEY,
          hook_name TEXT NOT NULL,
          status TEXT NOT NULL,
          url TEXT NOT NULL,
          headers_json TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          attempts INTEGER NOT NULL DEFAULT 0,
          next_attempt_at_ms INTEGER NOT NULL,
          lock_token TEXT,
          locked_by TEXT,
          lock_expires_at_ms INTEGER,
          last_error TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          delivered_at_ms INTEGER,
          failed_at_ms INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_due ON hook_outbox(status, next_attempt_at_ms);

        CREATE TABLE IF NOT EXISTS workflow_ops (
          op_id TEXT PRIMARY KEY,
          workflow_name TEXT NOT NULL,
          input_hash TEXT NOT NULL,
          state TEXT NOT NULL,
          result_json TEXT,
          error_json TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );
        "#,
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES ('store_schema_version', ?1)",
        params![STORE_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

fn ensure_instance_identity(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES ('instance_id', ?1)",
        params![uuid::Uuid::new_v4().to_string()],
    )?;
    Ok(())
}

pub(crate) fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key=?1", params![key], |row| {
            row.get::<_, String>(0)
        })
        .optional()?)
}

pub(crate) fn meta_set(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO meta(key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value=excluded.value
        "#,
        params![key, value],
    )?;
    Ok(())
}

pub(crate) fn meta_get_i64(conn: &Connection, key: &str) -> Result<Option<i64>, StoreError> {
    Ok(meta_get(conn, key)?.and_then(|raw| raw.parse::<i64>().ok()))
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };
    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            code.code == rusqlite::ErrorCode::ConstraintViolation
                || message.as_deref().is_some_and(|value| {
                    value.contains("UNIQUE constraint failed")
                        || value.contains("PRIMARY KEY constraint failed")
                })
        }
        _ => false,
    }
}
