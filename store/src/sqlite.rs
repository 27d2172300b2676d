//! SQLite file handling shared by the store.
//!
//! This module is the single authority for:
//! - Secure directory creation and Unix permission tightening
//! - Secure database file creation with permission hardening
//! - WAL/SHM sidecar paths, the corruption marker and quarantine renames
//! - Integrity scans run on open
//! - Timestamp encoding for TEXT columns

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags};

use crate::StoreError;

const CORRUPTION_MARKER_SUFFIX: &str = ".needs-check";

/// Create parent directories and the database file with owner-only permissions,
/// then open a connection with durability pragmas applied.
pub(crate) fn open_secure_db(
    path: &Path,
    busy_timeout: Duration,
) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_secure_dir(parent)?;
    }
    ensure_secure_db_files(path)?;

    let db = Connection::open(path)?;
    apply_pragmas(&db, busy_timeout)?;
    Ok(db)
}

pub(crate) fn apply_pragmas(db: &Connection, busy_timeout: Duration) -> Result<(), StoreError> {
    db.busy_timeout(busy_timeout)?;
    db.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

/// Ensure a directory exists with secure permissions.
///
/// On Unix, tightens to 0o700 when the directory is owned by the current user.
pub(crate) fn ensure_secure_dir(path: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(path).map_err(|e| StoreError::io(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        let metadata = std::fs::metadata(path).map_err(|e| StoreError::io(path, e))?;

        let our_uid = unsafe { libc::getuid() };
        if metadata.uid() != our_uid {
            return Ok(());
        }

        let current_mode = metadata.permissions().mode() & 0o777;
        if current_mode & 0o077 != 0 {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| StoreError::io(path, e))?;
        }
    }
    Ok(())
}

/// Create the database file as 0o600 if missing and tighten existing sidecars.
pub(crate) fn ensure_secure_db_files(path: &Path) -> Result<(), StoreError> {
    if !path.exists() {
        let mut options = OpenOptions::new();
        options.create(true).truncate(false).read(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path).map_err(|e| StoreError::io(path, e))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| StoreError::io(path, e))?;
        for suffix in ["-wal", "-shm"] {
            let sidecar = sidecar_path(path, suffix);
            if sidecar.exists() {
                let _ = std::fs::set_permissions(&sidecar, std::fs::Permissions::from_mode(0o600));
            }
        }
    }
    Ok(())
}

/// `<db><suffix>` next to the database file.
pub(crate) fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    match path.file_name() {
        Some(name) => path.with_file_name(format!("{}{suffix}", name.to_string_lossy())),
        None => PathBuf::from(format!("{}{suffix}", path.display())),
    }
}

// ── Integrity ───────────────────────────────────────────────────────────

pub(crate) fn corruption_marker(path: &Path) -> PathBuf {
    sidecar_path(path, CORRUPTION_MARKER_SUFFIX)
}

/// Leave a marker so the next open runs the full integrity check.
pub(crate) fn mark_corruption_observed(path: &Path) {
    let marker = corruption_marker(path);
    if let Err(err) = std::fs::write(&marker, Utc::now().to_rfc3339()) {
        tracing::warn!(path = %marker.display(), "Failed to write corruption marker: {err}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityScan {
    Quick,
    Full,
}

impl IntegrityScan {
    const fn pragma(self) -> &'static str {
        match self {
            IntegrityScan::Quick => "PRAGMA quick_check",
            IntegrityScan::Full => "PRAGMA integrity_check",
        }
    }
}

/// Run the scan; any result row other than a single `ok` is corruption.
pub(crate) fn check_integrity(db: &Connection, scan: IntegrityScan) -> Result<(), StoreError> {
    let mut stmt = db.prepare(scan.pragma())?;
    let rows: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<_, _>>()?;
    if rows.len() == 1 && rows[0] == "ok" {
        return Ok(());
    }
    Err(StoreError::StorageCorrupt {
        detail: rows.join("; "),
    })
}

/// Query-only connection that skips every check, used to salvage rows from a
/// file that failed its integrity scan.
///
/// Opened read-write without `CREATE` so SQLite can still attach an existing
/// WAL; `query_only` keeps the file itself untouched.
pub(crate) fn open_for_salvage(path: &Path) -> Result<Connection, StoreError> {
    let db = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    db.pragma_update(None, "query_only", "ON")?;
    Ok(db)
}

/// Move a database and its sidecars aside as `<db>.corrupt-<timestamp>`.
///
/// Returns the quarantined database path.
pub fn quarantine(path: &Path, now: DateTime<Utc>) -> Result<PathBuf, StoreError> {
    let stamp = now.format("%Y%m%dT%H%M%S%.3fZ");
    let target = sidecar_path(path, &format!(".corrupt-{stamp}"));
    std::fs::rename(path, &target).map_err(|e| StoreError::io(path, e))?;
    for suffix in ["-wal", "-shm"] {
        let sidecar = sidecar_path(path, suffix);
        if sidecar.exists() {
            let moved = sidecar_path(&target, suffix);
            if let Err(err) = std::fs::rename(&sidecar, &moved) {
                tracing::warn!(path = %sidecar.display(), "Failed to quarantine sidecar: {err}");
            }
        }
    }
    let marker = corruption_marker(path);
    if marker.exists() {
        let _ = std::fs::remove_file(&marker);
    }
    Ok(target)
}

// ── Timestamps ──────────────────────────────────────────────────────────

/// RFC 3339 with millisecond precision, always `Z`.
pub(crate) fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn decode_time(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::invalid_row(table, format!("timestamp '{raw}': {e}")))
}
