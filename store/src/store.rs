//! Durable Store - transactional record storage on SQLite
//!
//! Every write goes through a [`StoreTransaction`]: either all of its records
//! land or none do. The connection runs in WAL mode with `synchronous=FULL`, so
//! a confirmed commit survives process termination.
//!
//! Tables fall into three partitions:
//! - engine state: `journal_entries`, `state_history`, `sessions`,
//!   `rejection_log`, `engine_meta`
//! - UI preferences: `ui_prefs`, which refuses keys naming engine entities
//! - content: `content_cache`, `local_edits`, `pending_remote`
//!
//! The first two share the engine file opened by [`Store::open`]. Content
//! lives in a file of its own ([`Store::open_content`]) so a sync batch never
//! holds the write lock navigation needs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use haven_config::StoreSettings;
use haven_types::{
    CachedContent, ContentCacheEntry, JournalEntry, JournalSeq, Mode, NavEvent, OperationalState,
    RejectionReason, RejectionRecord, RouteId, SessionId, SessionOp, SessionRecord,
    SessionStatus, VersionedState,
};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::StoreError;
use crate::journal::{self, JournalStats};
use crate::sqlite::{
    IntegrityScan, check_integrity, corruption_marker, decode_time, encode_time,
    mark_corruption_observed, open_secure_db,
};

/// Preference keys may not start with any of these.
const RESERVED_PREFIXES: &[&str] = &["state", "session", "journal", "content", "mode", "route"];

/// A unit of write inside a [`StoreTransaction`].
///
/// Every variant is idempotent: applying the same record twice leaves the
/// same rows behind.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A new version of the operational state, keyed by the journal entry that produced it.
    StateVersion(VersionedState),
    /// Drop every state version at or after `from`.
    RewindHistory { from: JournalSeq },
    Session(SessionOp),
    Rejection(NewRejection),
    Content(ContentCacheEntry),
    /// A remote update parked behind an unresolved local edit.
    PendingRemote(ContentCacheEntry),
    ClearPendingRemote { source_id: String },
    LocalEdit {
        source_id: String,
        edited_at: DateTime<Utc>,
    },
    ResolveLocalEdit { source_id: String },
    Preference { key: String, value: String },
    Meta { key: String, value: String },
}

/// A rejection about to be logged. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRejection {
    pub mode: Mode,
    pub current_route: RouteId,
    pub requested_route: RouteId,
    pub event: NavEvent,
    pub reason: RejectionReason,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// A write inside the transaction failed, so nothing was applied.
    Aborted,
}

/// What [`Store::read`] can be asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    CurrentState,
    StateHistory { limit: usize },
    Session(SessionId),
    Sessions {
        status: Option<SessionStatus>,
        limit: usize,
    },
    Journal { limit: usize },
    PendingJournal,
    Rejections { limit: usize },
    Content,
    ContentEntry { source_id: String },
    PendingRemote,
    Preference { key: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rows {
    States(Vec<VersionedState>),
    Sessions(Vec<SessionRecord>),
    Journal(Vec<JournalEntry>),
    Rejections(Vec<RejectionRecord>),
    Content(Vec<ContentCacheEntry>),
    Preference(Option<String>),
}

pub struct Store {
    db: Connection,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Store {
    const ENGINE_SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS journal_entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            intent_kind TEXT NOT NULL,
            intent TEXT NOT NULL,
            target TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            committed INTEGER NOT NULL DEFAULT 0,
            committed_at TEXT,
            resolution TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_journal_pending
        ON journal_entries(seq) WHERE committed = 0 AND resolution IS NULL;

        CREATE TABLE IF NOT EXISTS state_history (
            version INTEGER PRIMARY KEY,
            mode TEXT NOT NULL,
            route TEXT NOT NULL,
            entered_at TEXT NOT NULL,
            context TEXT
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            mode TEXT NOT NULL,
            started_at TEXT NOT NULL,
            last_checkpoint_at TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rejection_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mode TEXT NOT NULL,
            current_route TEXT NOT NULL,
            requested_route TEXT NOT NULL,
            event TEXT NOT NULL,
            code TEXT NOT NULL,
            reason TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ui_prefs (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS engine_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
    ";

    const CONTENT_SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS content_cache (
            source_id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            fetched_at TEXT NOT NULL,
            validated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pending_remote (
            source_id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            fetched_at TEXT NOT NULL,
            validated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS local_edits (
            source_id TEXT PRIMARY KEY,
            edited_at TEXT NOT NULL
        );
    ";

    /// Open or create the engine store at `path`.
    ///
    /// Runs `PRAGMA quick_check`, or the full `integrity_check` when an
    /// earlier connection observed corruption. A failed scan returns
    /// [`StoreError::StorageCorrupt`] and leaves the file untouched.
    pub fn open(path: impl AsRef<Path>, settings: &StoreSettings) -> Result<Self, StoreError> {
        Self::open_with(path.as_ref(), settings, Self::ENGINE_SCHEMA)
    }

    /// Open or create the content cache at `path`, with the same checks as [`Store::open`].
    pub fn open_content(
        path: impl AsRef<Path>,
        settings: &StoreSettings,
    ) -> Result<Self, StoreError> {
        Self::open_with(path.as_ref(), settings, Self::CONTENT_SCHEMA)
    }

    fn open_with(
        path: &Path,
        settings: &StoreSettings,
        schema: &'static str,
    ) -> Result<Self, StoreError> {
        let marker = corruption_marker(path);
        let scan = if marker.exists() {
            IntegrityScan::Full
        } else {
            IntegrityScan::Quick
        };

        let opened = open_secure_db(path, settings.busy_timeout).and_then(|db| {
            check_integrity(&db, scan)?;
            Ok(db)
        });
        let db = match opened {
            Ok(db) => db,
            Err(err) => {
                if err.is_corruption() {
                    tracing::warn!(path = %path.display(), ?scan, "Integrity scan failed: {err}");
                    mark_corruption_observed(path);
                }
                return Err(err);
            }
        };

        if scan == IntegrityScan::Full {
            tracing::info!(path = %path.display(), "Full integrity check passed");
            let _ = std::fs::remove_file(&marker);
        }

        db.execute_batch(schema)?;
        Ok(Self {
            db,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory store holding every partition (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = Connection::open_in_memory()?;
        db.execute_batch(Self::ENGINE_SCHEMA)?;
        db.execute_batch(Self::CONTENT_SCHEMA)?;
        Ok(Self { db, path: None })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Refuse every write on this connection. Inspection commands use it.
    pub fn set_query_only(&self, enabled: bool) -> Result<(), StoreError> {
        self.db
            .pragma_update(None, "query_only", if enabled { "ON" } else { "OFF" })?;
        Ok(())
    }

    /// Start an immediate (write-locking) transaction.
    pub fn begin_transaction(&mut self) -> Result<StoreTransaction<'_>, StoreError> {
        let Store { db, path } = self;
        let path = path.as_deref();
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| observe(path, e.into()))?;
        Ok(StoreTransaction {
            tx,
            path,
            failed: false,
        })
    }

    /// Write `records` in a single transaction.
    pub fn write(&mut self, records: &[Record]) -> Result<CommitOutcome, StoreError> {
        let mut tx = self.begin_transaction()?;
        tx.write(records)?;
        tx.commit()
    }

    pub fn read(&self, query: &Query) -> Result<Rows, StoreError> {
        let rows = match query {
            Query::CurrentState => Rows::States(self.current_state()?.into_iter().collect()),
            Query::StateHistory { limit } => Rows::States(self.state_history(*limit)?),
            Query::Session(id) => Rows::Sessions(self.session(id)?.into_iter().collect()),
            Query::Sessions { status, limit } => Rows::Sessions(self.sessions(*status, *limit)?),
            Query::Journal { limit } => Rows::Journal(journal::recent_entries(&self.db, *limit)?),
            Query::PendingJournal => Rows::Journal(journal::pending_entries(&self.db)?),
            Query::Rejections { limit } => Rows::Rejections(self.rejections(*limit)?),
            Query::Content => Rows::Content(self.content_entries()?),
            Query::ContentEntry { source_id } => {
                Rows::Content(self.content(source_id)?.into_iter().collect())
            }
            Query::PendingRemote => Rows::Content(self.pending_remote_entries()?),
            Query::Preference { key } => Rows::Preference(self.preference(key)?),
        };
        Ok(rows)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.db
    }

    pub(crate) fn connection_mut(&mut self) -> (&mut Connection, Option<&Path>) {
        (&mut self.db, self.path.as_deref())
    }

    // ── State ───────────────────────────────────────────────────────────

    /// The newest state version, or `None` before first launch.
    pub fn current_state(&self) -> Result<Option<VersionedState>, StoreError> {
        self.db
            .query_row(
                "SELECT version, mode, route, entered_at, context FROM state_history
                 ORDER BY version DESC LIMIT 1",
                [],
                raw_state,
            )
            .optional()?
            .map(RawState::decode)
            .transpose()
    }

    /// State versions, newest first.
    pub fn state_history(&self, limit: usize) -> Result<Vec<VersionedState>, StoreError> {
        let mut stmt = self.db.prepare(
            "SELECT version, mode, route, entered_at, context FROM state_history
             ORDER BY version DESC LIMIT ?1",
        )?;
        let raws: Vec<RawState> = stmt
            .query_map(params![sql_limit(limit)], raw_state)?
            .collect::<Result<_, _>>()?;
        raws.into_iter().map(RawState::decode).collect()
    }

    // ── Sessions ────────────────────────────────────────────────────────

    pub fn session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.db
            .query_row(
                "SELECT id, mode, started_at, last_checkpoint_at, payload, status
                 FROM sessions WHERE id = ?1",
                params![id.as_str()],
                raw_session,
            )
            .optional()?
            .map(RawSession::decode)
            .transpose()
    }

    /// Sessions ordered by start time, newest first.
    pub fn sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let mut stmt = self.db.prepare(
            "SELECT id, mode, started_at, last_checkpoint_at, payload, status
             FROM sessions WHERE (?1 IS NULL OR status = ?1)
             ORDER BY started_at DESC, rowid DESC LIMIT ?2",
        )?;
        let raws: Vec<RawSession> = stmt
            .query_map(
                params![status.map(SessionStatus::as_str), sql_limit(limit)],
                raw_session,
            )?
            .collect::<Result<_, _>>()?;
        raws.into_iter().map(RawSession::decode).collect()
    }

    // ── Rejections ──────────────────────────────────────────────────────

    /// Logged rejections, newest first.
    pub fn rejections(&self, limit: usize) -> Result<Vec<RejectionRecord>, StoreError> {
        let mut stmt = self.db.prepare(
            "SELECT id, mode, current_route, requested_route, event, reason, recorded_at
             FROM rejection_log ORDER BY id DESC LIMIT ?1",
        )?;
        let raws: Vec<RawRejection> = stmt
            .query_map(params![sql_limit(limit)], |row| {
                Ok(RawRejection {
                    id: row.get(0)?,
                    mode: row.get(1)?,
                    current_route: row.get(2)?,
                    requested_route: row.get(3)?,
                    event: row.get(4)?,
                    reason: row.get(5)?,
                    recorded_at: row.get(6)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        raws.into_iter().map(RawRejection::decode).collect()
    }

    pub fn rejection_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM rejection_log", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    // ── Content partition ───────────────────────────────────────────────

    pub fn content(&self, source_id: &str) -> Result<Option<ContentCacheEntry>, StoreError> {
        content_row(&self.db, "content_cache", source_id)
    }

    pub fn content_entries(&self) -> Result<Vec<ContentCacheEntry>, StoreError> {
        content_rows(&self.db, "content_cache")
    }

    pub fn pending_remote(&self, source_id: &str) -> Result<Option<ContentCacheEntry>, StoreError> {
        content_row(&self.db, "pending_remote", source_id)
    }

    pub fn pending_remote_entries(&self) -> Result<Vec<ContentCacheEntry>, StoreError> {
        content_rows(&self.db, "pending_remote")
    }

    pub fn has_unresolved_edit(&self, source_id: &str) -> Result<bool, StoreError> {
        unresolved_edit(&self.db, source_id)
    }

    pub fn unresolved_edits(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .db
            .prepare("SELECT source_id FROM local_edits ORDER BY source_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    // ── UI preferences ──────────────────────────────────────────────────

    pub fn preference(&self, key: &str) -> Result<Option<String>, StoreError> {
        check_preference_key(key)?;
        Ok(self
            .db
            .query_row(
                "SELECT value FROM ui_prefs WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_preference(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write(&[Record::Preference {
            key: key.to_string(),
            value: value.to_string(),
        }])?;
        Ok(())
    }

    // ── Engine metadata ─────────────────────────────────────────────────

    pub fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .db
            .query_row(
                "SELECT value FROM engine_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn journal_stats(&self) -> Result<JournalStats, StoreError> {
        journal::stats_for_db(&self.db)
    }

    /// Journal entries, newest first, without taking the journal's write handle.
    pub fn journal_entries(&self, limit: usize) -> Result<Vec<JournalEntry>, StoreError> {
        journal::recent_entries(&self.db, limit)
    }
}

/// An open write transaction.
///
/// Dropping it without calling [`commit`](Self::commit) rolls everything back.
pub struct StoreTransaction<'s> {
    tx: rusqlite::Transaction<'s>,
    path: Option<&'s Path>,
    failed: bool,
}

impl StoreTransaction<'_> {
    /// Apply `records` inside the transaction.
    ///
    /// The first failing record poisons the transaction: later writes are
    /// refused and [`commit`](Self::commit) rolls back.
    pub fn write(&mut self, records: &[Record]) -> Result<(), StoreError> {
        if self.failed {
            return Err(StoreError::TransactionAborted);
        }
        for record in records {
            if let Err(err) = apply_record(&self.tx, record) {
                self.failed = true;
                return Err(observe(self.path, err));
            }
        }
        Ok(())
    }

    pub fn commit(self) -> Result<CommitOutcome, StoreError> {
        if self.failed {
            self.tx.rollback()?;
            tracing::debug!("Rolled back poisoned transaction");
            return Ok(CommitOutcome::Aborted);
        }
        let path = self.path;
        self.tx.commit().map_err(|e| observe(path, e.into()))?;
        Ok(CommitOutcome::Committed)
    }

    pub fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback()?;
        Ok(())
    }

    // Reads below see this transaction's own writes. The transaction holds
    // the write lock, so nothing else can change the rows in between.

    pub fn content(&self, source_id: &str) -> Result<Option<ContentCacheEntry>, StoreError> {
        content_row(&self.tx, "content_cache", source_id)
    }

    pub fn pending_remote(&self, source_id: &str) -> Result<Option<ContentCacheEntry>, StoreError> {
        content_row(&self.tx, "pending_remote", source_id)
    }

    pub fn pending_remote_entries(&self) -> Result<Vec<ContentCacheEntry>, StoreError> {
        content_rows(&self.tx, "pending_remote")
    }

    pub fn has_unresolved_edit(&self, source_id: &str) -> Result<bool, StoreError> {
        unresolved_edit(&self.tx, source_id)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.tx
    }

    pub(crate) fn poison(&mut self, err: StoreError) -> StoreError {
        self.failed = true;
        observe(self.path, err)
    }
}

/// Record runtime corruption so the next open runs the full scan.
pub(crate) fn observe(path: Option<&Path>, err: StoreError) -> StoreError {
    if err.is_corruption()
        && let Some(path) = path
    {
        mark_corruption_observed(path);
    }
    err
}

pub(crate) fn check_preference_key(key: &str) -> Result<(), StoreError> {
    let normalized = key.trim().to_ascii_lowercase();
    if normalized.is_empty()
        || RESERVED_PREFIXES
            .iter()
            .any(|prefix| normalized.starts_with(prefix))
    {
        return Err(StoreError::PartitionViolation {
            key: key.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn apply_record(db: &Connection, record: &Record) -> Result<(), StoreError> {
    match record {
        Record::StateVersion(versioned) => {
            let state = &versioned.state;
            db.execute(
                "INSERT OR IGNORE INTO state_history (version, mode, route, entered_at, context)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    versioned.version.value(),
                    state.mode.as_str(),
                    state.route.as_str(),
                    encode_time(state.entered_at),
                    state.context.as_ref().map(SessionId::as_str),
                ],
            )?;
        }
        Record::RewindHistory { from } => {
            db.execute(
                "DELETE FROM state_history WHERE version >= ?1",
                params![from.value()],
            )?;
        }
        Record::Session(op) => apply_session_op(db, op)?,
        Record::Rejection(rejection) => {
            db.execute(
                "INSERT INTO rejection_log
                 (mode, current_route, requested_route, event, code, reason, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    rejection.mode.as_str(),
                    rejection.current_route.as_str(),
                    rejection.requested_route.as_str(),
                    rejection.event.as_str(),
                    rejection.reason.code(),
                    serde_json::to_string(&rejection.reason)?,
                    encode_time(rejection.recorded_at),
                ],
            )?;
        }
        Record::Content(entry) => upsert_content(db, "content_cache", entry)?,
        Record::PendingRemote(entry) => upsert_content(db, "pending_remote", entry)?,
        Record::ClearPendingRemote { source_id } => {
            db.execute(
                "DELETE FROM pending_remote WHERE source_id = ?1",
                params![source_id],
            )?;
        }
        Record::LocalEdit {
            source_id,
            edited_at,
        } => {
            db.execute(
                "INSERT INTO local_edits (source_id, edited_at) VALUES (?1, ?2)
                 ON CONFLICT(source_id) DO UPDATE SET edited_at = excluded.edited_at",
                params![source_id, encode_time(*edited_at)],
            )?;
        }
        Record::ResolveLocalEdit { source_id } => {
            db.execute(
                "DELETE FROM local_edits WHERE source_id = ?1",
                params![source_id],
            )?;
        }
        Record::Preference { key, value } => {
            check_preference_key(key)?;
            db.execute(
                "INSERT INTO ui_prefs (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        Record::Meta { key, value } => {
            db.execute(
                "INSERT INTO engine_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
    }
    Ok(())
}

fn apply_session_op(db: &Connection, op: &SessionOp) -> Result<(), StoreError> {
    match op {
        SessionOp::Open { id, mode, at } => {
            db.execute(
                "INSERT OR IGNORE INTO sessions
                 (id, mode, started_at, last_checkpoint_at, payload, status)
                 VALUES (?1, ?2, ?3, ?3, '{}', ?4)",
                params![
                    id.as_str(),
                    mode.as_str(),
                    encode_time(*at),
                    SessionStatus::Active.as_str()
                ],
            )?;
        }
        SessionOp::Checkpoint { id, at, payload } => {
            let payload = payload.as_ref().map(serde_json::to_string).transpose()?;
            db.execute(
                "UPDATE sessions SET last_checkpoint_at = ?2, payload = COALESCE(?3, payload)
                 WHERE id = ?1 AND status IN ('ACTIVE', 'RECOVERED')",
                params![id.as_str(), encode_time(*at), payload],
            )?;
        }
        SessionOp::Close { id, status, at } => {
            db.execute(
                "UPDATE sessions SET status = ?2, last_checkpoint_at = ?3
                 WHERE id = ?1 AND status IN ('ACTIVE', 'RECOVERED')",
                params![id.as_str(), status.as_str(), encode_time(*at)],
            )?;
        }
        SessionOp::MarkRecovered { id, at } => {
            db.execute(
                "UPDATE sessions SET status = 'RECOVERED', last_checkpoint_at = ?2
                 WHERE id = ?1 AND status = 'ACTIVE'",
                params![id.as_str(), encode_time(*at)],
            )?;
        }
    }
    Ok(())
}

fn upsert_content(
    db: &Connection,
    table: &'static str,
    entry: &ContentCacheEntry,
) -> Result<(), StoreError> {
    let sql = format!(
        "INSERT INTO {table} (source_id, content, content_hash, fetched_at, validated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(source_id) DO UPDATE SET
             content = excluded.content,
             content_hash = excluded.content_hash,
             fetched_at = excluded.fetched_at,
             validated_at = excluded.validated_at"
    );
    db.execute(
        &sql,
        params![
            entry.source_id,
            serde_json::to_string(&entry.content)?,
            entry.content_hash,
            encode_time(entry.fetched_at),
            encode_time(entry.validated_at),
        ],
    )?;
    Ok(())
}

// ── Row decoding ────────────────────────────────────────────────────────
//
// Rows are pulled out as raw strings inside the rusqlite closure and decoded
// afterwards, so parse failures surface as `InvalidRow` rather than driver errors.

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

struct RawState {
    version: i64,
    mode: String,
    route: String,
    entered_at: String,
    context: Option<String>,
}

fn raw_state(row: &Row<'_>) -> rusqlite::Result<RawState> {
    Ok(RawState {
        version: row.get(0)?,
        mode: row.get(1)?,
        route: row.get(2)?,
        entered_at: row.get(3)?,
        context: row.get(4)?,
    })
}

impl RawState {
    fn decode(self) -> Result<VersionedState, StoreError> {
        const TABLE: &str = "state_history";
        let mode: Mode = self
            .mode
            .parse()
            .map_err(|e| StoreError::invalid_row(TABLE, e))?;
        let context = self
            .context
            .map(SessionId::parse)
            .transpose()
            .map_err(|e| StoreError::invalid_row(TABLE, e))?;
        Ok(VersionedState {
            version: JournalSeq::new(self.version),
            state: OperationalState {
                mode,
                route: RouteId::new(self.route),
                entered_at: decode_time(TABLE, &self.entered_at)?,
                context,
            },
        })
    }
}

struct RawSession {
    id: String,
    mode: String,
    started_at: String,
    last_checkpoint_at: String,
    payload: String,
    status: String,
}

fn raw_session(row: &Row<'_>) -> rusqlite::Result<RawSession> {
    Ok(RawSession {
        id: row.get(0)?,
        mode: row.get(1)?,
        started_at: row.get(2)?,
        last_checkpoint_at: row.get(3)?,
        payload: row.get(4)?,
        status: row.get(5)?,
    })
}

impl RawSession {
    fn decode(self) -> Result<SessionRecord, StoreError> {
        const TABLE: &str = "sessions";
        Ok(SessionRecord {
            id: SessionId::parse(self.id).map_err(|e| StoreError::invalid_row(TABLE, e))?,
            mode: self
                .mode
                .parse()
                .map_err(|e| StoreError::invalid_row(TABLE, e))?,
            started_at: decode_time(TABLE, &self.started_at)?,
            last_checkpoint_at: decode_time(TABLE, &self.last_checkpoint_at)?,
            payload: serde_json::from_str(&self.payload)?,
            status: self
                .status
                .parse()
                .map_err(|e| StoreError::invalid_row(TABLE, e))?,
        })
    }
}

struct RawRejection {
    id: i64,
    mode: String,
    current_route: String,
    requested_route: String,
    event: String,
    reason: String,
    recorded_at: String,
}

impl RawRejection {
    fn decode(self) -> Result<RejectionRecord, StoreError> {
        const TABLE: &str = "rejection_log";
        Ok(RejectionRecord {
            id: self.id,
            mode: self
                .mode
                .parse()
                .map_err(|e| StoreError::invalid_row(TABLE, e))?,
            current_route: RouteId::new(self.current_route),
            requested_route: RouteId::new(self.requested_route),
            event: self
                .event
                .parse()
                .map_err(|e| StoreError::invalid_row(TABLE, e))?,
            reason: serde_json::from_str(&self.reason)?,
            recorded_at: decode_time(TABLE, &self.recorded_at)?,
        })
    }
}

struct RawContent {
    source_id: String,
    content: String,
    content_hash: String,
    fetched_at: String,
    validated_at: String,
}

fn raw_content(row: &Row<'_>) -> rusqlite::Result<RawContent> {
    Ok(RawContent {
        source_id: row.get(0)?,
        content: row.get(1)?,
        content_hash: row.get(2)?,
        fetched_at: row.get(3)?,
        validated_at: row.get(4)?,
    })
}

impl RawContent {
    fn decode(self, table: &'static str) -> Result<ContentCacheEntry, StoreError> {
        let content: CachedContent = serde_json::from_str(&self.content)?;
        Ok(ContentCacheEntry {
            source_id: self.source_id,
            fetched_at: decode_time(table, &self.fetched_at)?,
            validated_at: decode_time(table, &self.validated_at)?,
            content,
            content_hash: self.content_hash,
        })
    }
}

fn unresolved_edit(db: &Connection, source_id: &str) -> Result<bool, StoreError> {
    let found: Option<i64> = db
        .query_row(
            "SELECT 1 FROM local_edits WHERE source_id = ?1",
            params![source_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn content_row(
    db: &Connection,
    table: &'static str,
    source_id: &str,
) -> Result<Option<ContentCacheEntry>, StoreError> {
    let sql = format!(
        "SELECT source_id, content, content_hash, fetched_at, validated_at
         FROM {table} WHERE source_id = ?1"
    );
    db.query_row(&sql, params![source_id], raw_content)
        .optional()?
        .map(|raw| raw.decode(table))
        .transpose()
}

fn content_rows(
    db: &Connection,
    table: &'static str,
) -> Result<Vec<ContentCacheEntry>, StoreError> {
    let sql = format!(
        "SELECT source_id, content, content_hash, fetched_at, validated_at
         FROM {table} ORDER BY source_id"
    );
    let mut stmt = db.prepare(&sql)?;
    let raws: Vec<RawContent> = stmt
        .query_map([], raw_content)?
        .collect::<Result<_, _>>()?;
    raws.into_iter().map(|raw| raw.decode(table)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn sample_content(id: &str, body: &str) -> ContentCacheEntry {
        ContentCacheEntry {
            source_id: id.to_string(),
            fetched_at: at(100),
            validated_at: at(100),
            content: CachedContent {
                title: "Grounding".to_string(),
                body: body.to_string(),
                url: None,
                updated_at: None,
            },
            content_hash: format!("hash-{body}"),
        }
    }

    #[test]
    fn test_open_in_memory_is_empty() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.current_state().unwrap().is_none());
        assert!(store.sessions(None, 10).unwrap().is_empty());
        assert_eq!(store.rejection_count().unwrap(), 0);
    }

    #[test]
    fn test_transaction_commits_all_records() {
        let mut store = Store::open_in_memory().unwrap();
        let session = SessionId::generate();
        let state = VersionedState {
            version: JournalSeq::new(1),
            state: OperationalState {
                mode: Mode::CrisisDetected,
                route: RouteId::from("crisis"),
                entered_at: at(10),
                context: Some(session.clone()),
            },
        };

        let mut tx = store.begin_transaction().unwrap();
        tx.write(&[
            Record::StateVersion(state.clone()),
            Record::Session(SessionOp::Open {
                id: session.clone(),
                mode: Mode::CrisisDetected,
                at: at(10),
            }),
        ])
        .unwrap();
        assert_eq!(tx.commit().unwrap(), CommitOutcome::Committed);

        assert_eq!(store.current_state().unwrap(), Some(state));
        let record = store.session(&session).unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Active);
        assert_eq!(record.mode, Mode::CrisisDetected);
    }

    #[test]
    fn test_failed_write_aborts_whole_transaction() {
        let mut store = Store::open_in_memory().unwrap();
        let mut tx = store.begin_transaction().unwrap();
        tx.write(&[Record::Meta {
            key: "clean_shutdown".to_string(),
            value: "1".to_string(),
        }])
        .unwrap();
        let err = tx
            .write(&[Record::Preference {
                key: "state.mode".to_string(),
                value: "LOCKED".to_string(),
            }])
            .unwrap_err();
        assert!(matches!(err, StoreError::PartitionViolation { .. }));
        assert!(matches!(
            tx.write(&[]).unwrap_err(),
            StoreError::TransactionAborted
        ));
        assert_eq!(tx.commit().unwrap(), CommitOutcome::Aborted);

        assert!(store.meta("clean_shutdown").unwrap().is_none());
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let mut store = Store::open_in_memory().unwrap();
        {
            let mut tx = store.begin_transaction().unwrap();
            tx.write(&[Record::Preference {
                key: "theme".to_string(),
                value: "dusk".to_string(),
            }])
            .unwrap();
        }
        assert!(store.preference("theme").unwrap().is_none());
    }

    #[test]
    fn test_state_version_insert_is_idempotent() {
        let mut store = Store::open_in_memory().unwrap();
        let state = VersionedState {
            version: JournalSeq::new(3),
            state: OperationalState::initial(RouteId::from("welcome"), at(0)),
        };
        store.write(&[Record::StateVersion(state.clone())]).unwrap();
        store.write(&[Record::StateVersion(state)]).unwrap();
        assert_eq!(store.state_history(10).unwrap().len(), 1);
    }

    #[test]
    fn test_rewind_history_drops_later_versions() {
        let mut store = Store::open_in_memory().unwrap();
        let version = |seq: i64, route: &str| VersionedState {
            version: JournalSeq::new(seq),
            state: OperationalState::initial(RouteId::from(route), at(0)),
        };
        store
            .write(&[
                Record::StateVersion(version(1, "welcome")),
                Record::StateVersion(version(4, "settings")),
                Record::StateVersion(version(9, "resources")),
            ])
            .unwrap();

        store
            .write(&[
                Record::RewindHistory {
                    from: JournalSeq::new(4),
                },
                Record::StateVersion(version(4, "home")),
            ])
            .unwrap();
        assert_eq!(store.current_state().unwrap(), Some(version(4, "home")));
        assert_eq!(store.state_history(10).unwrap().len(), 2);
    }

    #[test]
    fn test_session_ops_only_touch_open_sessions() {
        let mut store = Store::open_in_memory().unwrap();
        let id = SessionId::generate();
        store
            .write(&[
                Record::Session(SessionOp::Open {
                    id: id.clone(),
                    mode: Mode::NightWatch,
                    at: at(1),
                }),
                Record::Session(SessionOp::Checkpoint {
                    id: id.clone(),
                    at: at(2),
                    payload: Some(serde_json::json!({ "breaths": 4 })),
                }),
                Record::Session(SessionOp::Close {
                    id: id.clone(),
                    status: SessionStatus::Completed,
                    at: at(3),
                }),
                // Late ops against a closed session change nothing.
                Record::Session(SessionOp::MarkRecovered {
                    id: id.clone(),
                    at: at(4),
                }),
                Record::Session(SessionOp::Checkpoint {
                    id: id.clone(),
                    at: at(5),
                    payload: None,
                }),
            ])
            .unwrap();

        let record = store.session(&id).unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.last_checkpoint_at, at(3));
        assert_eq!(record.payload, serde_json::json!({ "breaths": 4 }));
        assert_eq!(record.started_at, at(1));
    }

    #[test]
    fn test_rejections_round_trip_newest_first() {
        let mut store = Store::open_in_memory().unwrap();
        for (i, reason) in [
            RejectionReason::AbandonmentNotHonored { mode: Mode::Locked },
            RejectionReason::ConfirmationRequired,
        ]
        .into_iter()
        .enumerate()
        {
            store
                .write(&[Record::Rejection(NewRejection {
                    mode: Mode::Locked,
                    current_route: RouteId::from("lockdown"),
                    requested_route: RouteId::from("home"),
                    event: NavEvent::AbandonAttempt,
                    reason,
                    recorded_at: at(i64::try_from(i).unwrap()),
                })])
                .unwrap();
        }
        let logged = store.rejections(10).unwrap();
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].reason, RejectionReason::ConfirmationRequired);
        assert_eq!(
            logged[1].reason,
            RejectionReason::AbandonmentNotHonored { mode: Mode::Locked }
        );
        assert_eq!(store.rejection_count().unwrap(), 2);
    }

    #[test]
    fn test_preferences_refuse_engine_keys() {
        let mut store = Store::open_in_memory().unwrap();
        store.set_preference("text_scale", "1.25").unwrap();
        assert_eq!(
            store.preference("text_scale").unwrap().as_deref(),
            Some("1.25")
        );
        for key in ["session_payload", "Mode", "journal", "route.last", "content:x", " "] {
            assert!(matches!(
                store.set_preference(key, "x").unwrap_err(),
                StoreError::PartitionViolation { .. }
            ));
        }
    }

    #[test]
    fn test_content_upsert_and_local_edits() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .write(&[Record::Content(sample_content("breathing", "v1"))])
            .unwrap();
        store
            .write(&[
                Record::Content(sample_content("breathing", "v2")),
                Record::LocalEdit {
                    source_id: "breathing".to_string(),
                    edited_at: at(5),
                },
                Record::PendingRemote(sample_content("breathing", "v3")),
            ])
            .unwrap();

        let cached = store.content("breathing").unwrap().unwrap();
        assert_eq!(cached.content.body, "v2");
        assert!(store.has_unresolved_edit("breathing").unwrap());
        assert_eq!(store.pending_remote_entries().unwrap().len(), 1);

        store
            .write(&[
                Record::ResolveLocalEdit {
                    source_id: "breathing".to_string(),
                },
                Record::ClearPendingRemote {
                    source_id: "breathing".to_string(),
                },
            ])
            .unwrap();
        assert!(store.unresolved_edits().unwrap().is_empty());
        assert!(store.pending_remote("breathing").unwrap().is_none());
    }

    #[test]
    fn test_read_dispatches_queries() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .write(&[Record::Content(sample_content("a", "body"))])
            .unwrap();
        match store.read(&Query::Content).unwrap() {
            Rows::Content(rows) => assert_eq!(rows.len(), 1),
            other => panic!("unexpected rows: {other:?}"),
        }
        assert_eq!(
            store.read(&Query::CurrentState).unwrap(),
            Rows::States(Vec::new())
        );
        assert!(matches!(
            store.read(&Query::Preference {
                key: "session".to_string()
            }),
            Err(StoreError::PartitionViolation { .. })
        ));
    }

    #[test]
    fn test_query_only_refuses_writes() {
        let mut store = Store::open_in_memory().unwrap();
        store.set_query_only(true).unwrap();
        assert!(store.set_preference("theme", "dusk").is_err());
        store.set_query_only(false).unwrap();
        store.set_preference("theme", "dusk").unwrap();
    }

    #[test]
    fn test_persistence_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haven.db");
        let settings = StoreSettings::default();
        {
            let mut store = Store::open(&path, &settings).unwrap();
            store.set_preference("theme", "dusk").unwrap();
        }
        let store = Store::open(&path, &settings).unwrap();
        assert_eq!(store.preference("theme").unwrap().as_deref(), Some("dusk"));
    }

    #[test]
    fn test_busy_database_reports_write_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haven.db");
        let settings = StoreSettings {
            busy_timeout: std::time::Duration::from_millis(10),
            ..StoreSettings::default()
        };
        let mut holder = Store::open(&path, &settings).unwrap();
        let mut other = Store::open(&path, &settings).unwrap();

        let _lock = holder.begin_transaction().unwrap();
        let err = other.set_preference("theme", "dusk").unwrap_err();
        assert!(err.is_retryable(), "expected WriteTimeout, got {err:?}");
    }

    #[test]
    fn test_engine_and_content_files_hold_their_own_tables() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StoreSettings::default();
        let mut engine = Store::open(dir.path().join("haven.db"), &settings).unwrap();
        let mut content = Store::open_content(dir.path().join("content.db"), &settings).unwrap();

        assert!(matches!(
            engine.write(&[Record::Content(sample_content("a", "body"))]),
            Err(StoreError::Sqlite(_))
        ));
        assert!(content.set_preference("theme", "dusk").is_err());

        content
            .write(&[Record::Content(sample_content("a", "body"))])
            .unwrap();
        engine.set_preference("theme", "dusk").unwrap();
        assert_eq!(content.content_entries().unwrap().len(), 1);
    }

    #[test]
    fn test_open_content_transaction_does_not_lock_engine_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StoreSettings {
            busy_timeout: std::time::Duration::from_millis(10),
            ..StoreSettings::default()
        };
        let mut engine = Store::open(dir.path().join("haven.db"), &settings).unwrap();
        let mut content = Store::open_content(dir.path().join("content.db"), &settings).unwrap();

        let mut batch = content.begin_transaction().unwrap();
        batch
            .write(&[Record::Content(sample_content("a", "body"))])
            .unwrap();
        engine.set_preference("theme", "dusk").unwrap();
        assert_eq!(batch.commit().unwrap(), CommitOutcome::Committed);
    }

    #[test]
    fn test_garbage_file_is_reported_corrupt_and_marked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haven.db");
        std::fs::write(&path, vec![0x5a; 8192]).unwrap();

        let err = Store::open(&path, &StoreSettings::default()).unwrap_err();
        assert!(err.is_corruption(), "expected corruption, got {err:?}");
        assert!(corruption_marker(&path).exists());
    }
}
