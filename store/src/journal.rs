//! Write-Ahead Session Journal
//!
//! Every state-affecting intent is appended and flushed here *before* any
//! state or session row changes. A crash between append and commit leaves a
//! pending entry behind, which the engine replays on the next open.
//!
//! # Entry lifecycle
//!
//! ```text
//! append ──► pending ──► committed        (apply + mark in one transaction)
//!                   ├──► aborted          (runtime persistence failure)
//!                   └──► superseded       (stale pending entry found on open)
//! ```
//!
//! Entries are never deleted. Sequence numbers come from `AUTOINCREMENT` and
//! are never reused, even after an aborted entry.

use chrono::{DateTime, Utc};
use haven_types::{Intent, JournalEntry, JournalResolution, JournalSeq, OperationalState};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::sqlite::{decode_time, encode_time};
use crate::store::observe;
use crate::{CommitOutcome, Record, Store, StoreError};

const TABLE: &str = "journal_entries";

/// Journal view over a [`Store`], obtained from [`Store::journal`].
pub struct Journal<'s> {
    store: &'s mut Store,
}

/// Statistics about the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalStats {
    pub total_entries: u64,
    pub committed_entries: u64,
    /// Neither committed nor resolved; crash repair replays these.
    pub pending_entries: u64,
    pub aborted_entries: u64,
    pub superseded_entries: u64,
    pub last_seq: Option<JournalSeq>,
    pub last_committed_seq: Option<JournalSeq>,
}

impl Store {
    pub fn journal(&mut self) -> Journal<'_> {
        Journal { store: self }
    }
}

impl Journal<'_> {
    /// Durably record `intent` and the state it produces.
    ///
    /// Runs in its own transaction and returns only after the entry is
    /// flushed, so the caller may proceed to apply it.
    pub fn append(
        &mut self,
        intent: &Intent,
        target: &OperationalState,
        recorded_at: DateTime<Utc>,
    ) -> Result<JournalSeq, StoreError> {
        let intent_json = serde_json::to_string(intent)?;
        let target_json = serde_json::to_string(target)?;

        let (db, path) = self.store.connection_mut();
        let seq = (|| -> Result<i64, StoreError> {
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO journal_entries (intent_kind, intent, target, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    intent.kind.as_str(),
                    intent_json,
                    target_json,
                    encode_time(recorded_at)
                ],
            )?;
            let seq = tx.last_insert_rowid();
            tx.commit()?;
            Ok(seq)
        })()
        .map_err(|e| observe(path, e))?;

        let seq = JournalSeq::new(seq);
        tracing::debug!(%seq, kind = %intent.kind, mode = %target.mode, "Journal intent appended");
        Ok(seq)
    }

    /// Apply `records` and mark entry `seq` committed in one transaction.
    ///
    /// Refuses to commit while an older entry is still pending, and refuses
    /// entries that are unknown or already resolved. On any failure nothing
    /// is applied and the entry stays pending.
    pub fn commit(
        &mut self,
        seq: JournalSeq,
        records: &[Record],
        committed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.store.begin_transaction()?;
        ensure_committable(tx.connection(), seq).map_err(|e| tx.poison(e))?;
        tx.write(records)?;
        tx.connection()
            .execute(
                "UPDATE journal_entries SET committed = 1, committed_at = ?2
                 WHERE seq = ?1 AND committed = 0 AND resolution IS NULL",
                params![seq.value(), encode_time(committed_at)],
            )
            .map_err(|e| tx.poison(e.into()))?;
        match tx.commit()? {
            CommitOutcome::Committed => {
                tracing::debug!(%seq, "Journal entry committed");
                Ok(())
            }
            CommitOutcome::Aborted => Err(StoreError::TransactionAborted),
        }
    }

    /// Mark `seq` committed without applying anything alongside it.
    pub fn mark_committed(
        &mut self,
        seq: JournalSeq,
        committed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.commit(seq, &[], committed_at)
    }

    /// Resolve a pending entry without applying it.
    pub fn resolve(
        &mut self,
        seq: JournalSeq,
        resolution: JournalResolution,
    ) -> Result<(), StoreError> {
        let (db, path) = self.store.connection_mut();
        let changed = db
            .execute(
                "UPDATE journal_entries SET resolution = ?2
                 WHERE seq = ?1 AND committed = 0 AND resolution IS NULL",
                params![seq.value(), resolution.as_str()],
            )
            .map_err(|e| observe(path, e.into()))?;
        if changed == 0 {
            return Err(StoreError::UnknownJournalEntry(seq));
        }
        tracing::info!(%seq, resolution = resolution.as_str(), "Journal entry resolved");
        Ok(())
    }

    /// Mark every pending entry older than the newest committed one superseded.
    ///
    /// Replaying such an entry would move state backwards.
    pub fn supersede_stale(&mut self) -> Result<Vec<JournalSeq>, StoreError> {
        let (db, path) = self.store.connection_mut();
        let stale = (|| -> Result<Vec<i64>, StoreError> {
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stale: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT seq FROM journal_entries
                     WHERE committed = 0 AND resolution IS NULL
                       AND seq < (SELECT COALESCE(MAX(seq), 0) FROM journal_entries
                                  WHERE committed = 1)
                     ORDER BY seq",
                )?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<Result<_, _>>()?
            };
            for seq in &stale {
                tx.execute(
                    "UPDATE journal_entries SET resolution = ?2 WHERE seq = ?1",
                    params![seq, JournalResolution::Superseded.as_str()],
                )?;
            }
            tx.commit()?;
            Ok(stale)
        })()
        .map_err(|e| observe(path, e))?;

        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), "Superseded stale journal entries");
        }
        Ok(stale.into_iter().map(JournalSeq::new).collect())
    }

    /// Pending entries in sequence order.
    pub fn replay_uncommitted(&self) -> Result<Vec<JournalEntry>, StoreError> {
        pending_entries(self.store.connection())
    }

    pub fn last_committed(&self) -> Result<Option<JournalEntry>, StoreError> {
        last_committed(self.store.connection())
    }

    pub fn entry(&self, seq: JournalSeq) -> Result<Option<JournalEntry>, StoreError> {
        self.store
            .connection()
            .query_row(
                &format!("{SELECT_ENTRY} WHERE seq = ?1"),
                params![seq.value()],
                raw_entry,
            )
            .optional()?
            .map(RawEntry::decode)
            .transpose()
    }

    /// Newest first.
    pub fn entries(&self, limit: usize) -> Result<Vec<JournalEntry>, StoreError> {
        recent_entries(self.store.connection(), limit)
    }

    pub fn stats(&self) -> Result<JournalStats, StoreError> {
        stats_for_db(self.store.connection())
    }
}

const SELECT_ENTRY: &str =
    "SELECT seq, intent, target, recorded_at, committed, resolution FROM journal_entries";

fn ensure_committable(db: &Connection, seq: JournalSeq) -> Result<(), StoreError> {
    let state: Option<(i64, Option<String>)> = db
        .query_row(
            "SELECT committed, resolution FROM journal_entries WHERE seq = ?1",
            params![seq.value()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match state {
        Some((0, None)) => {}
        _ => return Err(StoreError::UnknownJournalEntry(seq)),
    }

    let older_pending: Option<i64> = db
        .query_row(
            "SELECT MIN(seq) FROM journal_entries
             WHERE committed = 0 AND resolution IS NULL AND seq < ?1",
            params![seq.value()],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    if let Some(pending) = older_pending {
        return Err(StoreError::OutOfOrderCommit {
            seq,
            pending: JournalSeq::new(pending),
        });
    }
    Ok(())
}

pub(crate) fn pending_entries(db: &Connection) -> Result<Vec<JournalEntry>, StoreError> {
    query_entries(
        db,
        &format!("{SELECT_ENTRY} WHERE committed = 0 AND resolution IS NULL ORDER BY seq ASC"),
        params![],
    )
}

pub(crate) fn recent_entries(
    db: &Connection,
    limit: usize,
) -> Result<Vec<JournalEntry>, StoreError> {
    query_entries(
        db,
        &format!("{SELECT_ENTRY} ORDER BY seq DESC LIMIT ?1"),
        params![i64::try_from(limit).unwrap_or(i64::MAX)],
    )
}

pub(crate) fn last_committed(db: &Connection) -> Result<Option<JournalEntry>, StoreError> {
    db.query_row(
        &format!("{SELECT_ENTRY} WHERE committed = 1 ORDER BY seq DESC LIMIT 1"),
        [],
        raw_entry,
    )
    .optional()?
    .map(RawEntry::decode)
    .transpose()
}

fn query_entries<P: rusqlite::Params>(
    db: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<JournalEntry>, StoreError> {
    let mut stmt = db.prepare(sql)?;
    let raws: Vec<RawEntry> = stmt
        .query_map(params, raw_entry)?
        .collect::<Result<_, _>>()?;
    raws.into_iter().map(RawEntry::decode).collect()
}

pub(crate) fn stats_for_db(db: &Connection) -> Result<JournalStats, StoreError> {
    let (total, committed, pending, aborted, superseded): (i64, i64, i64, i64, i64) = db
        .query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(committed = 1), 0),
                COALESCE(SUM(committed = 0 AND resolution IS NULL), 0),
                COALESCE(SUM(resolution = 'aborted'), 0),
                COALESCE(SUM(resolution = 'superseded'), 0)
             FROM journal_entries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;

    let last_seq: Option<i64> = db.query_row("SELECT MAX(seq) FROM journal_entries", [], |row| {
        row.get(0)
    })?;
    let last_committed_seq: Option<i64> = db.query_row(
        "SELECT MAX(seq) FROM journal_entries WHERE committed = 1",
        [],
        |row| row.get(0),
    )?;

    let count = |n: i64| u64::try_from(n).unwrap_or(0);
    Ok(JournalStats {
        total_entries: count(total),
        committed_entries: count(committed),
        pending_entries: count(pending),
        aborted_entries: count(aborted),
        superseded_entries: count(superseded),
        last_seq: last_seq.map(JournalSeq::new),
        last_committed_seq: last_committed_seq.map(JournalSeq::new),
    })
}

struct RawEntry {
    seq: i64,
    intent: String,
    target: String,
    recorded_at: String,
    committed: bool,
    resolution: Option<String>,
}

fn raw_entry(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        seq: row.get(0)?,
        intent: row.get(1)?,
        target: row.get(2)?,
        recorded_at: row.get(3)?,
        committed: row.get(4)?,
        resolution: row.get(5)?,
    })
}

impl RawEntry {
    fn decode(self) -> Result<JournalEntry, StoreError> {
        let resolution = match self.resolution.as_deref() {
            None => None,
            Some(raw) => Some(JournalResolution::parse(raw).ok_or_else(|| {
                StoreError::invalid_row(TABLE, format!("unknown resolution '{raw}'"))
            })?),
        };
        let intent: Intent = serde_json::from_str(&self.intent)?;
        let target: OperationalState = serde_json::from_str(&self.target)?;
        Ok(JournalEntry {
            seq: JournalSeq::new(self.seq),
            intent,
            target,
            recorded_at: decode_time(TABLE, &self.recorded_at)?,
            committed: self.committed,
            resolution,
        })
    }
}
