#![forbid(unsafe_code)]

use std::collections::VecDeque;

use super::SqliteStore;
use super::error::StoreError;
use super::events::{AppendOutcome, EventInput};
use super::requests::ActorContext;
use super::types::EventEnvelope;
use super::{meta_get, meta_get_i64, meta_set, now_ms};

const META_LAST_PUSHED_SEQ: &str = "sync_last_pushed_seq";
const META_LAST_PULL_CURSOR: &str = "sync_last_pull_cursor";
const META_LAST_SYNCED_AT: &str = "sync_last_synced_at_ms";
const META_LAST_FAILURE_AT: &str = "sync_last_failure_at_ms";
const META_DIRTY: &str = "sync_dirty";

const RATE_WINDOW_MS: i64 = 60_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Sync only when asked.
    Manual,
    /// Reads demand a fresh sync and fail when it cannot be had.
    Strict,
    /// Background-style best effort, bounded by staleness and cooldowns.
    Opportunistic {
        staleness_ms: i64,
        min_interval_ms: i64,
        failure_cooldown_ms: i64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Push local events, pull remote ones; the log is append-only so merge
    /// is union plus idempotent replay.
    Merge,
    /// Stop advertising local events without sending them. The local log is
    /// untouched; only the push watermark moves.
    DiscardLocal,
    /// Refuse to sync while unpushed local events exist.
    Fail,
}

#[derive(Debug)]
pub enum TransportError {
    Timeout,
    Unavailable(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "transport timeout"),
            Self::Unavailable(message) => write!(f, "transport unavailable: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One page of remote events. An absent cursor means the replica has no more.
#[derive(Debug, Default)]
pub struct SyncFrame {
    pub events: Vec<EventEnvelope>,
    pub next_cursor: Option<String>,
}

pub trait ReplicaTransport {
    fn push_events(&mut self, events: &[EventEnvelope]) -> Result<(), TransportError>;
    fn pull_events(&mut self, cursor: Option<&str>) -> Result<SyncFrame, TransportError>;
}

#[derive(Clone, Debug, Default)]
pub struct SyncReport {
    pub attempted: bool,
    pub success: bool,
    pub pushed: usize,
    pub pulled: usize,
    pub error: Option<String>,
}

/// Drives replica exchange for one store. Transport failures degrade to a
/// failed report, never an error: local operation must keep working offline.
pub struct SyncPolicy {
    pub mode: SyncMode,
    pub strategy: ConflictStrategy,
    transport: Box<dyn ReplicaTransport>,
    attempts: VecDeque<i64>,
    max_attempts_per_minute: usize,
}

impl std::fmt::Debug for SyncPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPolicy")
            .field("mode", &self.mode)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl SyncPolicy {
    pub fn new(
        mode: SyncMode,
        strategy: ConflictStrategy,
        transport: Box<dyn ReplicaTransport>,
    ) -> Self {
        Self {
            mode,
            strategy,
            transport,
            attempts: VecDeque::new(),
            max_attempts_per_minute: 6,
        }
    }

    pub fn with_rate_limit(mut self, max_attempts_per_minute: usize) -> Self {
        self.max_attempts_per_minute = max_attempts_per_minute;
        self
    }

    /// Push-then-pull exchange. Returns `attempted: false` and a rate-cap
    /// error when the attempt window is full.
    pub fn sync(&mut self, store: &mut SqliteStore) -> Result<SyncReport, StoreError> {
        let now = now_ms();
        while let Some(&oldest) = self.attempts.front() {
            if now - oldest >= RATE_WINDOW_MS {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        if self.attempts.len() >= self.max_attempts_per_minute {
            // Reported, not thrown: callers can tell a capped skip apart
            // from a plain no-op.
            return Ok(SyncReport {
                error: Some("sync attempt rate cap reached".to_string()),
                ..SyncReport::default()
            });
        }
        self.attempts.push_back(now);

        let mut report = SyncReport {
            attempted: true,
            ..SyncReport::default()
        };

        let last_pushed = meta_get_i64(&store.conn, META_LAST_PUSHED_SEQ)?.unwrap_or(0);
        let local = store.events_after_seq(last_pushed)?;

        match self.strategy {
            ConflictStrategy::Fail if !local.is_empty() => {
                report.error = Some(format!(
                    "refusing to sync with {} unpushed local events",
                    local.len()
                ));
                meta_set(&store.conn, META_LAST_FAILURE_AT, &now.to_string())?;
                return Ok(report);
            }
            ConflictStrategy::Merge if !local.is_empty() => {
                if let Err(err) = self.transport.push_events(&local) {
                    return self.transport_failure(store, report, err);
                }
                report.pushed = local.len();
                let high = local.last().map(|e| e.seq).unwrap_or(last_pushed);
                meta_set(&store.conn, META_LAST_PUSHED_SEQ, &high.to_string())?;
            }
            ConflictStrategy::DiscardLocal if !local.is_empty() => {
                // Watermark only; the local log keeps its events.
                let high = local.last().map(|e| e.seq).unwrap_or(last_pushed);
                meta_set(&store.conn, META_LAST_PUSHED_SEQ, &high.to_string())?;
            }
            _ => {}
        }

        let mut cursor = meta_get(&store.conn, META_LAST_PULL_CURSOR)?;
        loop {
            let frame = match self.transport.pull_events(cursor.as_deref()) {
                Ok(frame) => frame,
                Err(err) => return self.transport_failure(store, report, err),
            };
            for remote in frame.events {
                let input = EventInput {
                    event_id: Some(remote.event_id),
                    task_id: remote.task_id,
                    kind: remote.kind,
                    data: remote.data,
                    actor: ActorContext {
                        author: remote.author,
                        agent_id: remote.agent_id,
                        session_id: remote.session_id,
                        correlation_id: remote.correlation_id,
                        causation_id: remote.causation_id,
                    },
                    schema_version: Some(remote.schema_version),
                    ts_ms: Some(remote.ts_ms),
                };
                if let AppendOutcome::Inserted(_) = store.append_idempotent(input)? {
                    report.pulled += 1;
                }
            }
            match frame.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if let Some(cursor) = cursor {
            meta_set(&store.conn, META_LAST_PULL_CURSOR, &cursor)?;
        }
        meta_set(&store.conn, META_LAST_SYNCED_AT, &now_ms().to_string())?;
        meta_set(&store.conn, META_DIRTY, "0")?;
        report.success = true;
        Ok(report)
    }

    fn transport_failure(
        &mut self,
        store: &mut SqliteStore,
        mut report: SyncReport,
        err: TransportError,
    ) -> Result<SyncReport, StoreError> {
        tracing::warn!(error = %err, "replica sync failed; continuing offline");
        meta_set(&store.conn, META_LAST_FAILURE_AT, &now_ms().to_string())?;
        report.error = Some(err.to_string());
        Ok(report)
    }

    /// Freshness gate before a read. Strict mode turns a failed sync into an
    /// error; opportunistic mode syncs quietly when the data has gone stale
    /// and the cooldowns permit.
    pub fn before_read(&mut self, store: &mut SqliteStore) -> Result<(), StoreError> {
        match self.mode {
            SyncMode::Manual => Ok(()),
            SyncMode::Strict => {
                let report = self.sync(store)?;
                if report.attempted && !report.success {
                    return Err(StoreError::SyncFailed(
                        report
                            .error
                            .unwrap_or_else(|| "sync did not complete".to_string()),
                    ));
                }
                Ok(())
            }
            SyncMode::Opportunistic {
                staleness_ms,
                failure_cooldown_ms,
                ..
            } => {
                // A stale read syncs regardless of the inter-sync interval;
                // that interval paces writes only.
                let now = now_ms();
                let synced_at = meta_get_i64(&store.conn, META_LAST_SYNCED_AT)?.unwrap_or(0);
                if now - synced_at < staleness_ms {
                    return Ok(());
                }
                let failed_at = meta_get_i64(&store.conn, META_LAST_FAILURE_AT)?.unwrap_or(0);
                if failed_at > 0 && now - failed_at < failure_cooldown_ms {
                    return Ok(());
                }
                let _ = self.sync(store)?;
                Ok(())
            }
        }
    }

    /// Post-write hook. Manual mode just marks the store dirty; strict mode
    /// pushes eagerly and surfaces the failure; opportunistic mode defers to
    /// its intervals.
    pub fn after_write(&mut self, store: &mut SqliteStore) -> Result<(), StoreError> {
        meta_set(&store.conn, META_DIRTY, "1")?;
        match self.mode {
            SyncMode::Manual => Ok(()),
            SyncMode::Strict => {
                let report = self.sync(store)?;
                if report.attempted && !report.success {
                    return Err(StoreError::SyncFailed(
                        report
                            .error
                            .unwrap_or_else(|| "sync did not complete".to_string()),
                    ));
                }
                Ok(())
            }
            SyncMode::Opportunistic {
                min_interval_ms,
                failure_cooldown_ms,
                ..
            } => {
                let now = now_ms();
                let synced_at = meta_get_i64(&store.conn, META_LAST_SYNCED_AT)?.unwrap_or(0);
                if now - synced_at < min_interval_ms {
                    return Ok(());
                }
                let failed_at = meta_get_i64(&store.conn, META_LAST_FAILURE_AT)?.unwrap_or(0);
                if failed_at > 0 && now - failed_at < failure_cooldown_ms {
                    return Ok(());
                }
                let _ = self.sync(store)?;
                Ok(())
            }
        }
    }
}

impl SqliteStore {
    /// Local events newer than the push watermark, i.e. not yet replicated.
    pub fn unsynced_event_count(&self) -> Result<usize, StoreError> {
        let last_pushed = meta_get_i64(&self.conn, META_LAST_PUSHED_SEQ)?.unwrap_or(0);
        Ok(self.events_after_seq(last_pushed)?.len())
    }
}
