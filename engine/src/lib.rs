//! Mode-aware navigation engine for Haven.
//!
//! The [`Engine`] owns the durable [`Store`] and the current
//! [`OperationalState`]. Every state-affecting request goes through the
//! navigation guard, which journals the intent before anything changes:
//!
//! ```text
//! request ──► route table ──► state machine ──► journal append ──► commit
//!                 │                 │                  │              │
//!                 └──── rejected ◄──┴──── rejected ◄───┴── aborted ◄──┘
//! ```
//!
//! Opening an engine runs crash recovery first (see [`RecoveryReport`]), so a
//! freshly opened engine always reflects the last committed journal entry.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use haven_config::{Settings, StoreSettings};
use haven_store::{Store, StoreError, WriteRetry};
use haven_types::{
    JournalEntry, JournalSeq, OperationalState, RejectionRecord, SessionId, SessionRecord,
    SessionStatus, VersionedState,
};

mod clock;
mod error;
mod guard;
mod machine;
mod recovery;
mod routes;
mod service;


pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, RecoveryAction, ServiceError};
pub use guard::{CheckpointOutcome, NavigationOutcome, NavigationRequest};
pub use haven_store::JournalStats;
pub use machine::{Decision, EventOrigin, TransitionContext, containment_remaining, transition};
pub use recovery::{CorruptionReport, RecoveryReport};
pub use routes::{PANIC, RoutePermission, RouteTable, WELCOME};
pub use service::NavigationService;

/// `engine_meta` key holding `"1"` after a clean shutdown and `"0"` while running.
pub const CLEAN_SHUTDOWN_KEY: &str = "clean_shutdown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub store: StoreSettings,
    /// Least time spent in `NIGHT_WATCH` before it may de-escalate.
    pub min_containment: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl EngineOptions {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            store: settings.store,
            min_containment: settings.policy.min_containment,
        }
    }
}

pub struct Engine {
    store: Store,
    /// Current state and the journal entry that produced it.
    state: VersionedState,
    routes: RouteTable,
    clock: Arc<dyn Clock>,
    options: EngineOptions,
    retry: WriteRetry,
    /// An entry whose commit failed and whose abort could not be recorded
    /// either. It is resolved before the next request is served.
    pending_abort: Option<JournalSeq>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("state", &self.state)
            .field("options", &self.options)
            .field("pending_abort", &self.pending_abort)
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn state(&self) -> &OperationalState {
        &self.state.state
    }

    /// Journal entry that produced the current state.
    #[must_use]
    pub fn version(&self) -> JournalSeq {
        self.state.version
    }

    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn database_path(&self) -> Option<&Path> {
        self.store.path()
    }

    /// Time left before `NIGHT_WATCH` may de-escalate, if that is the current mode.
    #[must_use]
    pub fn containment_remaining(&self) -> Option<Duration> {
        (self.state.state.mode == haven_types::Mode::NightWatch).then(|| {
            containment_remaining(
                self.state.state.entered_at,
                self.clock.now(),
                self.options.min_containment,
            )
        })
    }

    /// The session owned by the current mode.
    pub fn open_session(&self) -> Result<Option<SessionRecord>, EngineError> {
        match &self.state.state.context {
            Some(id) => Ok(self.store.session(id)?),
            None => Ok(None),
        }
    }

    pub fn session(&self, id: &SessionId) -> Result<Option<SessionRecord>, EngineError> {
        Ok(self.store.session(id)?)
    }

    pub fn sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<SessionRecord>, EngineError> {
        Ok(self.store.sessions(status, limit)?)
    }

    /// State versions, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<VersionedState>, EngineError> {
        Ok(self.store.state_history(limit)?)
    }

    pub fn journal(&self, limit: usize) -> Result<Vec<JournalEntry>, EngineError> {
        Ok(self.store.journal_entries(limit)?)
    }

    pub fn journal_stats(&self) -> Result<JournalStats, EngineError> {
        Ok(self.store.journal_stats()?)
    }

    pub fn rejections(&self, limit: usize) -> Result<Vec<RejectionRecord>, EngineError> {
        Ok(self.store.rejections(limit)?)
    }

    /// UI preference lookup. Keys in engine partitions are refused.
    pub fn preference(&self, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.store.preference(key)?)
    }

    pub fn set_preference(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
        let store = &mut self.store;
        self.retry.run(|| store.set_preference(key, value))?;
        Ok(())
    }

    /// Record a clean shutdown so the next open does not resume.
    pub fn shutdown(mut self) -> Result<(), EngineError> {
        self.write_clean_shutdown(true)?;
        tracing::info!(mode = %self.state.state.mode, "Engine shut down cleanly");
        Ok(())
    }

    fn write_clean_shutdown(&mut self, clean: bool) -> Result<(), StoreError> {
        let record = haven_store::Record::Meta {
            key: CLEAN_SHUTDOWN_KEY.to_string(),
            value: if clean { "1" } else { "0" }.to_string(),
        };
        let store = &mut self.store;
        self.retry
            .run(|| store.write(std::slice::from_ref(&record)))
            .map(|_| ())
    }

    #[cfg(test)]
    pub(crate) fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }
}
