//! Opening an engine: integrity, crash repair and resume.
//!
//! # Open sequence
//!
//! 1. Open the store. A failed integrity scan salvages what it can, moves the
//!    file aside and seeds a fresh store with a `RESTORE` intent.
//! 2. Supersede pending entries older than the newest committed one.
//! 3. Replay the remaining pending entries in order, each committed once.
//! 4. Take the current state from the last committed entry; state history
//!    never overrides the journal. An empty store is initialized to IDLE.
//! 5. Without a clean-shutdown marker, journal a `RESUME` that marks the open
//!    session recovered.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use haven_store::{Record, SalvagedState, Store, StoreError, WriteRetry, quarantine, salvage};
use haven_types::{
    Intent, IntentKind, JournalSeq, NavEvent, OperationalState, SessionId, SessionOp,
    VersionedState,
};

use crate::guard::{Plan, commit_records};
use crate::machine::{self, Decision, EventOrigin, TransitionContext};
use crate::routes::RouteTable;
use crate::{CLEAN_SHUTDOWN_KEY, Clock, Engine, EngineError, EngineOptions};

/// What happened while opening the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// The store was empty and has been initialized to IDLE.
    pub first_launch: bool,
    /// Stale pending entries resolved as superseded.
    pub superseded: Vec<JournalSeq>,
    /// Pending entries re-applied and committed.
    pub replayed: Vec<JournalSeq>,
    /// The previous run ended without a clean shutdown.
    pub resumed: bool,
    /// The newest state history row disagreed with the last committed
    /// journal entry. The journal wins.
    pub history_diverged: bool,
    pub corruption: Option<CorruptionReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionReport {
    /// Where the unreadable database now lives.
    pub quarantined: PathBuf,
    /// The `RESTORE` entry that seeded the fresh store.
    pub restored: JournalSeq,
}

impl Engine {
    /// Open the store at `path` and run crash recovery.
    pub fn open(
        path: &Path,
        options: EngineOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, RecoveryReport), EngineError> {
        match Store::open(path, &options.store) {
            Ok(store) => Self::recover(store, options, clock, None),
            Err(err) if err.is_corruption() => Self::open_corrupt(path, options, clock),
            Err(err) => Err(err.into()),
        }
    }

    /// Open an empty store at `path`, the action offered after
    /// [`EngineError::CorruptionUnrecoverable`]. A file still at `path` is
    /// quarantined first, never deleted.
    pub fn start_fresh(
        path: &Path,
        options: EngineOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, RecoveryReport), EngineError> {
        if path.exists() {
            let moved = quarantine(path, clock.now())?;
            tracing::warn!(quarantined = %moved.display(), "Starting fresh");
        }
        Self::open(path, options, clock)
    }

    /// Run recovery on an already open store.
    pub fn from_store(
        store: Store,
        options: EngineOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, RecoveryReport), EngineError> {
        Self::recover(store, options, clock, None)
    }

    fn open_corrupt(
        path: &Path,
        options: EngineOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, RecoveryReport), EngineError> {
        let now = clock.now();
        let salvaged = salvage(path);
        let quarantined = quarantine(path, now)?;
        tracing::error!(
            path = %path.display(),
            quarantined = %quarantined.display(),
            salvaged = salvaged.is_some(),
            "Store failed its integrity scan"
        );

        let Some(salvaged) = salvaged else {
            return Err(EngineError::CorruptionUnrecoverable { quarantined });
        };

        let mut store = Store::open(path, &options.store)?;
        let retry = WriteRetry::from_settings(&options.store);
        let restored = restore(&mut store, retry, &salvaged, now)?;
        tracing::warn!(
            %restored,
            mode = %salvaged.state.mode,
            "Restored salvaged state into a fresh store"
        );

        Self::recover(
            store,
            options,
            clock,
            Some(CorruptionReport {
                quarantined,
                restored,
            }),
        )
    }

    fn recover(
        mut store: Store,
        options: EngineOptions,
        clock: Arc<dyn Clock>,
        corruption: Option<CorruptionReport>,
    ) -> Result<(Self, RecoveryReport), EngineError> {
        let retry = WriteRetry::from_settings(&options.store);
        let now = clock.now();

        let superseded = retry.run(|| store.journal().supersede_stale())?;
        let replayed = replay_pending(&mut store, retry, now)?;
        let settled = settle_state(&mut store, retry, now)?;

        let clean = store.meta(CLEAN_SHUTDOWN_KEY)?.as_deref() == Some("1");
        let resume = !settled.first_launch
            && corruption.is_none()
            && (!clean || !replayed.is_empty());

        let mut engine = Engine {
            store,
            state: settled.state,
            routes: RouteTable::standard(),
            clock,
            options,
            retry,
            pending_abort: None,
        };
        if resume {
            engine.resume()?;
        }
        engine.write_clean_shutdown(false)?;

        let report = RecoveryReport {
            first_launch: settled.first_launch,
            superseded,
            replayed,
            resumed: resume,
            history_diverged: settled.history_diverged,
            corruption,
        };
        tracing::info!(
            mode = %engine.state.state.mode,
            route = %engine.state.state.route,
            version = %engine.state.version,
            first_launch = report.first_launch,
            replayed = report.replayed.len(),
            resumed = report.resumed,
            "Engine ready"
        );
        Ok((engine, report))
    }

    /// Re-enter the current state after an unclean shutdown.
    fn resume(&mut self) -> Result<(), EngineError> {
        let now = self.clock.now();
        let ctx = TransitionContext {
            origin: EventOrigin::Recovery,
            trigger: None,
            confirmation: None,
            now,
            min_containment: self.options.min_containment,
        };
        let to = match machine::transition(&self.state.state, NavEvent::Resume, &ctx) {
            Decision::Advance { to } => to,
            Decision::Reject(reason) => {
                tracing::warn!(%reason, "Resume refused");
                return Ok(());
            }
        };

        let mut intent = Intent::new(IntentKind::Resume).with_event(NavEvent::Resume);
        if let Some(id) = &self.state.state.context {
            intent = intent.with_session_op(SessionOp::MarkRecovered {
                id: id.clone(),
                at: now,
            });
        }
        let target = OperationalState {
            mode: to,
            ..self.state.state.clone()
        };

        let staged = self.stage(Plan { intent, target })?;
        let seq = staged.seq();
        self.commit_staged(staged)?;
        tracing::warn!(%seq, mode = %self.state.state.mode, "Resumed after unclean shutdown");
        Ok(())
    }
}

fn replay_pending(
    store: &mut Store,
    retry: WriteRetry,
    now: DateTime<Utc>,
) -> Result<Vec<JournalSeq>, StoreError> {
    let pending = store.journal().replay_uncommitted()?;
    let mut replayed = Vec::with_capacity(pending.len());
    for entry in pending {
        let records = commit_records(entry.seq, &entry.intent, &entry.target);
        retry.run(|| store.journal().commit(entry.seq, &records, now))?;
        tracing::warn!(
            seq = %entry.seq,
            kind = %entry.intent.kind,
            mode = %entry.target.mode,
            "Replayed uncommitted journal entry"
        );
        replayed.push(entry.seq);
    }
    Ok(replayed)
}

struct Settled {
    state: VersionedState,
    first_launch: bool,
    history_diverged: bool,
}

/// Make state history agree with the last committed journal entry.
fn settle_state(
    store: &mut Store,
    retry: WriteRetry,
    now: DateTime<Utc>,
) -> Result<Settled, StoreError> {
    let last = store.journal().last_committed()?;
    let current = store.current_state()?;

    match (last, current) {
        (Some(entry), current) => {
            let agrees = current.as_ref().is_some_and(|c| c.state == entry.target);
            if !agrees {
                tracing::warn!(
                    seq = %entry.seq,
                    "State history disagrees with the journal; rewinding to the last committed entry"
                );
                // Versions past the last committed entry have nothing behind them.
                let records = [
                    Record::RewindHistory { from: entry.seq },
                    Record::StateVersion(VersionedState {
                        version: entry.seq,
                        state: entry.target.clone(),
                    }),
                ];
                retry.run(|| store.write(&records))?;
            }
            let version = match current {
                Some(current) if agrees => current.version,
                _ => entry.seq,
            };
            Ok(Settled {
                state: VersionedState {
                    version,
                    state: entry.target,
                },
                first_launch: false,
                history_diverged: !agrees,
            })
        }
        (None, Some(current)) => {
            tracing::warn!("State history has no journal behind it; journaling it as a restore");
            let intent = Intent::new(IntentKind::Restore);
            let seq = journal_and_commit(store, retry, &intent, &current.state, now)?;
            Ok(Settled {
                state: VersionedState {
                    version: seq,
                    state: current.state,
                },
                first_launch: false,
                history_diverged: true,
            })
        }
        (None, None) => {
            let target = OperationalState::initial(RouteTable::initial_route(), now);
            let intent = Intent::new(IntentKind::Initialize);
            let seq = journal_and_commit(store, retry, &intent, &target, now)?;
            tracing::info!(%seq, "Initialized empty store");
            Ok(Settled {
                state: VersionedState {
                    version: seq,
                    state: target,
                },
                first_launch: true,
                history_diverged: false,
            })
        }
    }
}

/// Seed a fresh store with salvaged state.
///
/// The salvaged session is re-created as `RECOVERED` with its last payload.
/// A session-owning mode whose session did not survive gets a new one.
fn restore(
    store: &mut Store,
    retry: WriteRetry,
    salvaged: &SalvagedState,
    now: DateTime<Utc>,
) -> Result<JournalSeq, StoreError> {
    let mut intent = Intent::new(IntentKind::Restore);
    let mut target = salvaged.state.clone();

    let session = salvaged
        .session
        .as_ref()
        .filter(|s| s.status.is_open() && s.mode == target.mode);
    target.context = match session {
        Some(session) => {
            intent = intent
                .with_session_op(SessionOp::Open {
                    id: session.id.clone(),
                    mode: session.mode,
                    at: session.started_at,
                })
                .with_session_op(SessionOp::Checkpoint {
                    id: session.id.clone(),
                    at: session.last_checkpoint_at,
                    payload: Some(session.payload.clone()),
                })
                .with_session_op(SessionOp::MarkRecovered {
                    id: session.id.clone(),
                    at: now,
                });
            Some(session.id.clone())
        }
        None if target.mode.owns_sessions() => {
            let id = SessionId::generate();
            intent = intent.with_session_op(SessionOp::Open {
                id: id.clone(),
                mode: target.mode,
                at: now,
            });
            Some(id)
        }
        None => None,
    };

    journal_and_commit(store, retry, &intent, &target, now)
}

fn journal_and_commit(
    store: &mut Store,
    retry: WriteRetry,
    intent: &Intent,
    target: &OperationalState,
    now: DateTime<Utc>,
) -> Result<JournalSeq, StoreError> {
    let seq = retry.run(|| store.journal().append(intent, target, now))?;
    let records = commit_records(seq, intent, target);
    retry.run(|| store.journal().commit(seq, &records, now))?;
    Ok(seq)
}
