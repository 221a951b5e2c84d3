#![forbid(unsafe_code)]

use rusqlite::{OptionalExtension, Transaction, params};
use std::collections::BTreeMap;

use super::types::EventEnvelope;
use super::{SqliteStore, StoreError, events};

/// One derived read model. Projectors run synchronously in registration
/// order; later projectors may read tables earlier ones maintain, so the
/// order is a correctness dependency, not a convenience.
pub trait Projector {
    fn name(&self) -> &'static str;
    fn apply(&self, tx: &Transaction<'_>, event: &EventEnvelope) -> Result<(), StoreError>;
    /// Must clear every table this projector owns; an under-clearing reset
    /// leaves orphans that survive a rebuild.
    fn reset(&self, tx: &Transaction<'_>) -> Result<(), StoreError>;
}

pub(crate) fn checkpoint_tx(tx: &Transaction<'_>, projector: &str) -> Result<i64, StoreError> {
    Ok(tx
        .query_row(
            "SELECT last_seq FROM projection_state WHERE projector=?1",
            params![projector],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .unwrap_or(0))
}

pub(crate) fn set_checkpoint_tx(
    tx: &Transaction<'_>,
    projector: &str,
    last_seq: i64,
) -> Result<(), StoreError> {
    tx.execute(
        r#"
        INSERT INTO projection_state(projector, last_seq) VALUES (?1, ?2)
        ON CONFLICT(projector) DO UPDATE SET last_seq=excluded.last_seq
        "#,
        params![projector, last_seq],
    )?;
    Ok(())
}

/// Feeds one freshly appended event through every projector that has not yet
/// seen it, advancing each checkpoint. Runs inside the appending transaction.
pub(crate) fn apply_event_tx(
    tx: &Transaction<'_>,
    projectors: &[Box<dyn Projector>],
    event: &EventEnvelope,
) -> Result<(), StoreError> {
    for projector in projectors {
        if checkpoint_tx(tx, projector.name())? < event.seq {
            projector.apply(tx, event)?;
            set_checkpoint_tx(tx, projector.name(), event.seq)?;
        }
    }
    Ok(())
}

impl SqliteStore {
    pub fn projection_checkpoint(&self, projector: &str) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT last_seq FROM projection_state WHERE projector=?1",
                params![projector],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .unwrap_or(0))
    }

    /// Incremental replay: every projector consumes the events past its own
    /// checkpoint. Used after replica sync pulls and when a new projector is
    /// introduced behind existing data.
    pub fn catch_up_projections(&mut self) -> Result<usize, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let mut checkpoints = BTreeMap::new();
        let mut floor = i64::MAX;
        for projector in &self.projectors {
            let checkpoint = checkpoint_tx(&tx, projector.name())?;
            floor = floor.min(checkpoint);
            checkpoints.insert(projector.name(), checkpoint);
        }
        if floor == i64::MAX {
            tx.commit()?;
            return Ok(0);
        }

        let pending = events::events_after_seq_tx(&tx, &self.upcasters, floor)?;
        let mut applied = 0usize;
        for event in &pending {
            let mut advanced = false;
            for projector in &self.projectors {
                let Some(checkpoint) = checkpoints.get_mut(projector.name()) else {
                    continue;
                };
                if *checkpoint < event.seq {
                    projector.apply(&tx, event)?;
                    *checkpoint = event.seq;
                    advanced = true;
                }
            }
            if advanced {
                applied += 1;
            }
        }
        for projector in &self.projectors {
            set_checkpoint_tx(&tx, projector.name(), checkpoints[projector.name()])?;
        }

        tx.commit()?;
        Ok(applied)
    }

    /// Truncates every derived table and replays the whole log from sequence
    /// zero through every projector in order, atomically. Safe to run
    /// repeatedly; this is the recovery path for projection corruption and
    /// the migration path for retroactive projectors.
    pub fn rebuild_all_projections(&mut self) -> Result<usize, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        for projector in &self.projectors {
            projector.reset(&tx)?;
            set_checkpoint_tx(&tx, projector.name(), 0)?;
        }

        let all = events::events_after_seq_tx(&tx, &self.upcasters, 0)?;
        let mut last_seq = 0;
        for event in &all {
            for projector in &self.projectors {
                projector.apply(&tx, event)?;
            }
            last_seq = event.seq;
        }
        for projector in &self.projectors {
            set_checkpoint_tx(&tx, projector.name(), last_seq)?;
        }

        tx.commit()?;
        Ok(all.len())
    }
}
