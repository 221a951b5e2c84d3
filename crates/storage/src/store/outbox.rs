#![forbid(unsafe_code)]

use rusqlite::{TransactionBehavior, params};
use serde_json::Value;
use std::time::Duration;

use super::SqliteStore;
use super::error::StoreError;
use super::now_ms;
use super::requests::EnqueueHookRequest;
use super::types::{OutboxRow, OutboxStatus};

const OUTBOX_COLUMNS: &str = "id, hook_name, status, url, headers_json, payload_json, attempts, \
    next_attempt_at_ms, lock_token, locked_by, lock_expires_at_ms, last_error, created_at_ms, \
    updated_at_ms, delivered_at_ms, failed_at_ms";

#[derive(Debug)]
pub enum DeliveryError {
    /// Endpoint answered outside 2xx.
    Http { status: u16 },
    Transport(String),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http { status } => write!(f, "http status {status}"),
            Self::Transport(message) => write!(f, "transport: {message}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// One claimed record, as handed to the transport.
#[derive(Clone, Debug)]
pub struct HookDelivery {
    pub id: String,
    pub hook_name: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub payload: Value,
    pub attempt: i64,
}

pub trait WebhookTransport {
    fn deliver(&self, delivery: &HookDelivery) -> Result<(), DeliveryError>;
}

/// Blocking HTTP POST transport.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl WebhookTransport for UreqTransport {
    fn deliver(&self, delivery: &HookDelivery) -> Result<(), DeliveryError> {
        let mut request = self.agent.post(&delivery.url);
        for (name, value) in &delivery.headers {
            request = request.set(name, value);
        }
        match request.send_json(delivery.payload.clone()) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, _)) => Err(DeliveryError::Http { status }),
            Err(err) => Err(DeliveryError::Transport(err.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DrainConfig {
    pub batch_size: usize,
    pub max_attempts: i64,
    pub base_backoff_ms: i64,
    pub max_backoff_ms: i64,
    pub jitter_ms: i64,
    /// Claims older than this are presumed crashed and go back to queued.
    pub lock_ttl_ms: i64,
    pub worker_id: String,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_attempts: 8,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter_ms: 250,
            lock_ttl_ms: 60_000,
            worker_id: format!("worker_{}", std::process::id()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub reclaimed: usize,
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Drains the hook outbox: reclaim expired claims, claim a due batch under a
/// lock token, deliver outside any transaction, then finalize each record
/// guarded by that token so a reclaiming competitor cannot be overwritten.
pub struct HookDrainService {
    transport: Box<dyn WebhookTransport>,
    config: DrainConfig,
}

impl HookDrainService {
    pub fn new(transport: Box<dyn WebhookTransport>, config: DrainConfig) -> Self {
        Self { transport, config }
    }

    pub fn drain(&self, store: &mut SqliteStore) -> Result<DrainReport, StoreError> {
        let mut report = DrainReport::default();
        let now = now_ms();

        let claimed: Vec<(HookDelivery, String)> = {
            let tx = store
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;

            report.reclaimed = tx.execute(
                "UPDATE hook_outbox SET status='queued', lock_token=NULL, locked_by=NULL, \
                    lock_expires_at_ms=NULL, updated_at_ms=?1 \
                 WHERE status='processing' AND lock_expires_at_ms<?1",
                params![now],
            )?;

            let due: Vec<(String, String, String, String, String, i64)> = {
                let mut stmt = tx.prepare_cached(
                    "SELECT id, hook_name, url, headers_json, payload_json, attempts \
                     FROM hook_outbox \
                     WHERE status='queued' AND next_attempt_at_ms<=?1 \
                     ORDER BY next_attempt_at_ms ASC, id ASC \
                     LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![now, self.config.batch_size as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ));
                }
                out
            };

            let mut claimed = Vec::with_capacity(due.len());
            for (id, hook_name, url, headers_json, payload_json, attempts) in due {
                let token = uuid::Uuid::new_v4().to_string();
                tx.execute(
                    "UPDATE hook_outbox SET status='processing', lock_token=?2, locked_by=?3, \
                        lock_expires_at_ms=?4, attempts=attempts+1, updated_at_ms=?5 \
                     WHERE id=?1",
                    params![
                        id,
                        token,
                        self.config.worker_id,
                        now + self.config.lock_ttl_ms,
                        now,
                    ],
                )?;
                claimed.push((
                    HookDelivery {
                        id,
                        hook_name,
                        url,
                        headers: serde_json::from_str(&headers_json)?,
                        payload: serde_json::from_str(&payload_json)?,
                        attempt: attempts + 1,
                    },
                    token,
                ));
            }
            tx.commit()?;
            claimed
        };
        report.claimed = claimed.len();

        for (delivery, token) in claimed {
            match self.transport.deliver(&delivery) {
                Ok(()) => {
                    let done = now_ms();
                    let updated = store.conn.execute(
                        "UPDATE hook_outbox SET status='delivered', delivered_at_ms=?3, \
                            updated_at_ms=?3, lock_token=NULL, locked_by=NULL, \
                            lock_expires_at_ms=NULL, last_error=NULL \
                         WHERE id=?1 AND lock_token=?2",
                        params![delivery.id, token, done],
                    )?;
                    if updated == 1 {
                        report.delivered += 1;
                    } else {
                        // Our claim expired mid-delivery and someone else owns
                        // the record now; their outcome wins.
                        tracing::warn!(record = %delivery.id, "outbox lock lost after delivery");
                    }
                }
                Err(err) => {
                    let done = now_ms();
                    let updated = if delivery.attempt >= self.config.max_attempts {
                        store.conn.execute(
                            "UPDATE hook_outbox SET status='failed', failed_at_ms=?3, \
                                updated_at_ms=?3, last_error=?4, lock_token=NULL, \
                                locked_by=NULL, lock_expires_at_ms=NULL \
                             WHERE id=?1 AND lock_token=?2",
                            params![delivery.id, token, done, err.to_string()],
                        )?
                    } else {
                        store.conn.execute(
                            "UPDATE hook_outbox SET status='queued', next_attempt_at_ms=?3, \
                                updated_at_ms=?4, last_error=?5, lock_token=NULL, \
                                locked_by=NULL, lock_expires_at_ms=NULL \
                             WHERE id=?1 AND lock_token=?2",
                            params![
                                delivery.id,
                                token,
                                done + self.backoff_ms(delivery.attempt),
                                done,
                                err.to_string(),
                            ],
                        )?
                    };
                    if updated == 1 {
                        if delivery.attempt >= self.config.max_attempts {
                            report.failed += 1;
                        } else {
                            report.retried += 1;
                        }
                    } else {
                        tracing::warn!(record = %delivery.id, "outbox lock lost after failure");
                    }
                }
            }
        }

        Ok(report)
    }

    /// Exponential in the attempt number, capped, plus jitter so a burst of
    /// failures does not resynchronize into a thundering retry.
    fn backoff_ms(&self, attempt: i64) -> i64 {
        let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(30);
        let base = self
            .config
            .base_backoff_ms
            .saturating_mul(1_i64 << exponent)
            .min(self.config.max_backoff_ms);
        base + fastrand::i64(0..=self.config.jitter_ms.max(0))
    }
}

fn read_outbox(row: &rusqlite::Row<'_>) -> Result<OutboxRow, StoreError> {
    let status_raw: String = row.get(2)?;
    let headers_json: String = row.get(4)?;
    let payload_json: String = row.get(5)?;
    Ok(OutboxRow {
        id: row.get(0)?,
        hook_name: row.get(1)?,
        status: OutboxStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::Payload(format!("unknown outbox status: {status_raw}")))?,
        url: row.get(3)?,
        headers: serde_json::from_str(&headers_json)?,
        payload: serde_json::from_str(&payload_json)?,
        attempts: row.get(6)?,
        next_attempt_at_ms: row.get(7)?,
        lock_token: row.get(8)?,
        locked_by: row.get(9)?,
        lock_expires_at_ms: row.get(10)?,
        last_error: row.get(11)?,
        created_at_ms: row.get(12)?,
        updated_at_ms: row.get(13)?,
        delivered_at_ms: row.get(14)?,
        failed_at_ms: row.get(15)?,
    })
}

impl SqliteStore {
    /// Queues a webhook for a later drain; nothing leaves the process here.
    pub fn enqueue_hook(&mut self, request: EnqueueHookRequest) -> Result<OutboxRow, StoreError> {
        let now = now_ms();
        let id = format!("hook_{}", uuid::Uuid::now_v7().simple());
        self.conn.execute(
            "INSERT INTO hook_outbox(id, hook_name, status, url, headers_json, payload_json, \
                attempts, next_attempt_at_ms, created_at_ms, updated_at_ms) \
             VALUES (?1, ?2, 'queued', ?3, ?4, ?5, 0, ?6, ?6, ?6)",
            params![
                id,
                request.hook_name,
                request.url,
                serde_json::to_string(&request.headers)?,
                serde_json::to_string(&request.payload)?,
                now,
            ],
        )?;
        self.outbox_record(&id)?
            .ok_or(StoreError::InvalidInput("enqueued record not found"))
    }

    pub fn outbox_record(&self, id: &str) -> Result<Option<OutboxRow>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {OUTBOX_COLUMNS} FROM hook_outbox WHERE id=?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_outbox(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_outbox(&self, status: Option<OutboxStatus>) -> Result<Vec<OutboxRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM hook_outbox \
             WHERE (?1 IS NULL OR status=?1) \
             ORDER BY created_at_ms ASC, id ASC"
        ))?;
        let mut rows = stmt.query(params![status.map(|s| s.as_str())])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_outbox(row)?);
        }
        Ok(out)
    }
}
