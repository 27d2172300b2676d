//! Best-effort recovery from a database that failed its integrity scan.
//!
//! Reads through a read-only connection and skips anything it cannot
//! decode. The newest committed journal target wins; state history is the
//! fallback when the journal pages are unreadable.

use std::path::Path;

use haven_types::{JournalSeq, OperationalState, SessionId, SessionRecord};
use rusqlite::{Connection, params};

use crate::sqlite::{decode_time, open_for_salvage};

const SALVAGE_SCAN_LIMIT: i64 = 64;

/// The newest state that could still be read, plus its open session.
#[derive(Debug, Clone, PartialEq)]
pub struct SalvagedState {
    pub state: OperationalState,
    /// Journal entry the state came from, when it was read from the journal.
    pub from_seq: Option<JournalSeq>,
    pub session: Option<SessionRecord>,
}

/// Returns `None` when nothing usable survives.
#[must_use]
pub fn salvage(path: &Path) -> Option<SalvagedState> {
    let db = match open_for_salvage(path) {
        Ok(db) => db,
        Err(err) => {
            tracing::warn!(path = %path.display(), "Salvage open failed: {err}");
            return None;
        }
    };

    let (state, from_seq) = match from_journal(&db) {
        Some((state, seq)) => (state, Some(seq)),
        None => (from_history(&db)?, None),
    };
    let session = state
        .context
        .as_ref()
        .and_then(|id| salvage_session(&db, id));

    tracing::info!(
        mode = %state.mode,
        route = %state.route,
        from_journal = from_seq.is_some(),
        "Salvaged last committed state"
    );
    Some(SalvagedState {
        state,
        from_seq,
        session,
    })
}

fn from_journal(db: &Connection) -> Option<(OperationalState, JournalSeq)> {
    let mut stmt = db
        .prepare(
            "SELECT seq, target FROM journal_entries WHERE committed = 1
             ORDER BY seq DESC LIMIT ?1",
        )
        .ok()?;
    let rows = stmt
        .query_map(params![SALVAGE_SCAN_LIMIT], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .ok()?;
    for row in rows {
        let Ok((seq, target)) = row else {
            break;
        };
        if let Ok(state) = serde_json::from_str::<OperationalState>(&target) {
            return Some((state, JournalSeq::new(seq)));
        }
    }
    None
}

fn from_history(db: &Connection) -> Option<OperationalState> {
    let mut stmt = db
        .prepare(
            "SELECT mode, route, entered_at, context FROM state_history
             ORDER BY version DESC LIMIT ?1",
        )
        .ok()?;
    let rows = stmt
        .query_map(params![SALVAGE_SCAN_LIMIT], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })
        .ok()?;
    for row in rows {
        let Ok((mode, route, entered_at, context)) = row else {
            break;
        };
        let (Ok(mode), Ok(entered_at)) = (mode.parse(), decode_time("state_history", &entered_at))
        else {
            continue;
        };
        return Some(OperationalState {
            mode,
            route: route.as_str().into(),
            entered_at,
            context: context.and_then(|c| SessionId::parse(c).ok()),
        });
    }
    None
}

fn salvage_session(db: &Connection, id: &SessionId) -> Option<SessionRecord> {
    let row = db
        .query_row(
            "SELECT mode, started_at, last_checkpoint_at, payload, status
             FROM sessions WHERE id = ?1",
            params![id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .ok()?;
    let (mode, started_at, last_checkpoint_at, payload, status) = row;
    Some(SessionRecord {
        id: id.clone(),
        mode: mode.parse().ok()?,
        started_at: decode_time("sessions", &started_at).ok()?,
        last_checkpoint_at: decode_time("sessions", &last_checkpoint_at).ok()?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        status: status.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Record, Store};
    use chrono::{DateTime, Utc};
    use haven_config::StoreSettings;
    use haven_types::{Intent, IntentKind, Mode, NavEvent, RouteId, SessionOp, VersionedState};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn salvages_newest_committed_target_and_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haven.db");
        let session = SessionId::generate();
        let state = OperationalState {
            mode: Mode::NightWatch,
            route: RouteId::from("night_watch"),
            entered_at: at(50),
            context: Some(session.clone()),
        };
        {
            let mut store = Store::open(&path, &StoreSettings::default()).unwrap();
            let intent = Intent::new(IntentKind::Transition).with_event(NavEvent::StandDown);
            let seq = store.journal().append(&intent, &state, at(50)).unwrap();
            store
                .journal()
                .commit(
                    seq,
                    &[
                        Record::StateVersion(VersionedState {
                            version: seq,
                            state: state.clone(),
                        }),
                        Record::Session(SessionOp::Open {
                            id: session.clone(),
                            mode: Mode::NightWatch,
                            at: at(50),
                        }),
                    ],
                    at(50),
                )
                .unwrap();
            // A later pending entry must not be salvaged.
            let pending = OperationalState {
                mode: Mode::Recovery,
                ..state.clone()
            };
            store.journal().append(&intent, &pending, at(60)).unwrap();
        }

        let salvaged = salvage(&path).unwrap();
        assert_eq!(salvaged.state, state);
        assert!(salvaged.from_seq.is_some());
        assert_eq!(salvaged.session.unwrap().mode, Mode::NightWatch);
    }

    #[test]
    fn garbage_file_salvages_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("haven.db");
        std::fs::write(&path, vec![0x5a; 4096]).unwrap();
        assert!(salvage(&path).is_none());
    }
}
