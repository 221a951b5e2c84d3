#![forbid(unsafe_code)]

use rusqlite::{OptionalExtension, Transaction, params};
use serde_json::Value;
use tl_core::model::{EVENT_SCHEMA_VERSION, EventKind, validate_event_payload};

use super::requests::ActorContext;
use super::types::EventEnvelope;
use super::upcast::UpcastRegistry;
use super::{SqliteStore, StoreError, is_constraint_violation, now_ms, projection};

#[derive(Clone, Debug)]
pub struct EventInput {
    /// Assigned (UUIDv7, creation-time sortable) when the caller omits it.
    pub event_id: Option<String>,
    pub task_id: Option<String>,
    pub kind: EventKind,
    pub data: Value,
    pub actor: ActorContext,
    /// Stamped with the current version for local appends; replicated events
    /// keep their origin stamp.
    pub schema_version: Option<i64>,
    /// Defaults to now; replicated events keep their origin timestamp.
    pub ts_ms: Option<i64>,
}

impl EventInput {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            event_id: None,
            task_id: None,
            kind,
            data,
            actor: ActorContext::default(),
            schema_version: None,
            ts_ms: None,
        }
    }

    pub fn for_task(task_id: impl Into<String>, kind: EventKind, data: Value) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::new(kind, data)
        }
    }
}

/// Explicit duplicate signal for at-least-once senders; never an error.
#[derive(Clone, Debug)]
pub enum AppendOutcome {
    Inserted(EventEnvelope),
    AlreadyExists,
}

#[derive(Clone, Debug)]
pub struct EventQuery {
    pub after_id: Option<String>,
    pub limit: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            after_id: None,
            limit: 500,
        }
    }
}

impl SqliteStore {
    /// Appends one event and applies it through every registered projector in
    /// the same transaction. A colliding caller-supplied id is an error.
    pub fn append(&mut self, input: EventInput) -> Result<EventEnvelope, StoreError> {
        // Immediate, like every write path: the read-check-append sequence
        // holds the write lock from its first statement, so of N racing
        // processes exactly one observes the pre-state.
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let event = append_event_tx(&tx, &self.upcasters, input)?;
        projection::apply_event_tx(&tx, &self.projectors, &event)?;
        tx.commit()?;
        Ok(event)
    }

    /// Like [`SqliteStore::append`] but an id collision is a no-op, which is
    /// the contract replica sync and other at-least-once senders rely on.
    pub fn append_idempotent(&mut self, input: EventInput) -> Result<AppendOutcome, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let outcome = append_idempotent_tx(&tx, &self.upcasters, input)?;
        if let AppendOutcome::Inserted(event) = &outcome {
            projection::apply_event_tx(&tx, &self.projectors, event)?;
        }
        tx.commit()?;
        Ok(outcome)
    }

    /// Task history in ascending sequence order — the only ordering guarantee
    /// the store exposes for a task.
    pub fn events_by_task(
        &self,
        task_id: &str,
        query: EventQuery,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let after_seq = match query.after_id.as_deref() {
            None => 0,
            Some(event_id) => self
                .conn
                .query_row(
                    "SELECT seq FROM events WHERE event_id=?1",
                    params![event_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .ok_or(StoreError::InvalidInput("after_id: no such event"))?,
        };

        let mut stmt = self.conn.prepare(
            "SELECT seq, event_id, task_id, type, data_json, author, agent_id, session_id, \
                    correlation_id, causation_id, schema_version, ts_ms \
             FROM events \
             WHERE task_id=?1 AND seq>?2 \
             ORDER BY seq ASC \
             LIMIT ?3",
        )?;
        let mut rows = stmt.query(params![task_id, after_seq, query.limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(upcast_row(&self.upcasters, read_event_row(row)?)?);
        }
        Ok(out)
    }

    /// Events past a sequence number, upcast, ascending. Used by replica push.
    pub fn events_after_seq(&self, after_seq: i64) -> Result<Vec<EventEnvelope>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, event_id, task_id, type, data_json, author, agent_id, session_id, \
                    correlation_id, causation_id, schema_version, ts_ms \
             FROM events WHERE seq>?1 ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![after_seq])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(upcast_row(&self.upcasters, read_event_row(row)?)?);
        }
        Ok(out)
    }

    pub fn max_event_seq(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM events", [], |row| {
                row.get::<_, i64>(0)
            })?)
    }
}

struct RawEvent {
    seq: i64,
    event_id: String,
    task_id: Option<String>,
    event_type: String,
    data_json: String,
    author: Option<String>,
    agent_id: Option<String>,
    session_id: Option<String>,
    correlation_id: Option<String>,
    causation_id: Option<String>,
    schema_version: i64,
    ts_ms: i64,
}

fn read_event_row(row: &rusqlite::Row<'_>) -> Result<RawEvent, rusqlite::Error> {
    Ok(RawEvent {
        seq: row.get(0)?,
        event_id: row.get(1)?,
        task_id: row.get(2)?,
        event_type: row.get(3)?,
        data_json: row.get(4)?,
        author: row.get(5)?,
        agent_id: row.get(6)?,
        session_id: row.get(7)?,
        correlation_id: row.get(8)?,
        causation_id: row.get(9)?,
        schema_version: row.get(10)?,
        ts_ms: row.get(11)?,
    })
}

fn upcast_row(upcasters: &UpcastRegistry, raw: RawEvent) -> Result<EventEnvelope, StoreError> {
    let kind = EventKind::parse(&raw.event_type)
        .ok_or_else(|| StoreError::UnknownEventType(raw.event_type.clone()))?;
    let data: Value = serde_json::from_str(&raw.data_json)
        .map_err(|err| StoreError::Payload(format!("stored payload unreadable: {err}")))?;
    Ok(EventEnvelope {
        seq: raw.seq,
        event_id: raw.event_id,
        task_id: raw.task_id,
        kind,
        data: upcasters.upcast(kind, raw.schema_version, data),
        author: raw.author,
        agent_id: raw.agent_id,
        session_id: raw.session_id,
        correlation_id: raw.correlation_id,
        causation_id: raw.causation_id,
        schema_version: raw.schema_version,
        ts_ms: raw.ts_ms,
    })
}

/// Validates, assigns id/timestamp/version, inserts, and returns the stored
/// envelope with its store-assigned sequence. Payloads are stored as given
/// (older versions are upcast on read); validation always runs against the
/// upcast shape. Versions newer than this build skip validation entirely.
pub(crate) fn append_event_tx(
    tx: &Transaction<'_>,
    upcasters: &UpcastRegistry,
    input: EventInput,
) -> Result<EventEnvelope, StoreError> {
    let schema_version = input.schema_version.unwrap_or(EVENT_SCHEMA_VERSION);
    let current_data = upcasters.upcast(input.kind, schema_version, input.data.clone());
    if schema_version <= EVENT_SCHEMA_VERSION {
        validate_event_payload(input.kind, &current_data)?;
    }

    let event_id = input
        .event_id
        .unwrap_or_else(|| format!("evt_{}", uuid::Uuid::now_v7().simple()));
    let ts_ms = input.ts_ms.unwrap_or_else(now_ms);

    let insert = tx.execute(
        "INSERT INTO events(event_id, task_id, type, data_json, author, agent_id, session_id, \
                            correlation_id, causation_id, schema_version, ts_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            event_id,
            input.task_id,
            input.kind.as_str(),
            input.data.to_string(),
            input.actor.author,
            input.actor.agent_id,
            input.actor.session_id,
            input.actor.correlation_id,
            input.actor.causation_id,
            schema_version,
            ts_ms,
        ],
    );
    if let Err(err) = insert {
        if is_constraint_violation(&err) {
            return Err(StoreError::DuplicateEventId(event_id));
        }
        return Err(err.into());
    }

    Ok(EventEnvelope {
        seq: tx.last_insert_rowid(),
        event_id,
        task_id: input.task_id,
        kind: input.kind,
        data: current_data,
        author: input.actor.author,
        agent_id: input.actor.agent_id,
        session_id: input.actor.session_id,
        correlation_id: input.actor.correlation_id,
        causation_id: input.actor.causation_id,
        schema_version,
        ts_ms,
    })
}

pub(crate) fn append_idempotent_tx(
    tx: &Transaction<'_>,
    upcasters: &UpcastRegistry,
    input: EventInput,
) -> Result<AppendOutcome, StoreError> {
    if let Some(event_id) = input.event_id.as_deref() {
        let exists = tx
            .query_row(
                "SELECT 1 FROM events WHERE event_id=?1",
                params![event_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(AppendOutcome::AlreadyExists);
        }
    }
    match append_event_tx(tx, upcasters, input) {
        Ok(event) => Ok(AppendOutcome::Inserted(event)),
        Err(StoreError::DuplicateEventId(_)) => Ok(AppendOutcome::AlreadyExists),
        Err(err) => Err(err),
    }
}

/// Upcast events past `after_seq` in ascending order, read inside `tx`.
pub(crate) fn events_after_seq_tx(
    tx: &Transaction<'_>,
    upcasters: &UpcastRegistry,
    after_seq: i64,
) -> Result<Vec<EventEnvelope>, StoreError> {
    let mut stmt = tx.prepare(
        "SELECT seq, event_id, task_id, type, data_json, author, agent_id, session_id, \
                correlation_id, causation_id, schema_version, ts_ms \
         FROM events WHERE seq>?1 ORDER BY seq ASC",
    )?;
    let mut rows = stmt.query(params![after_seq])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(upcast_row(upcasters, read_event_row(row)?)?);
    }
    Ok(out)
}
