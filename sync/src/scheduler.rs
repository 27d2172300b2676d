//! Background sync on a fixed interval.
//!
//! The scheduler owns its reconciler on a task of its own. Renderers read
//! the latest [`SyncStatus`] from a watch channel; nothing is shared with
//! the navigation path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{Connectivity, ContentSource, Reconciler, SkipReason, SyncOutcome, SyncReport};

/// What the last finished sync did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastSync {
    Updated(SyncReport),
    Skipped(SkipReason),
    Failed { code: &'static str, message: String },
}

impl From<&SyncOutcome> for LastSync {
    fn from(outcome: &SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Updated(report) => LastSync::Updated(*report),
            SyncOutcome::Skipped(reason) => LastSync::Skipped(*reason),
            SyncOutcome::Failed(failure) => LastSync::Failed {
                code: failure.code(),
                message: failure.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub running: bool,
    /// Finished syncs, whatever their outcome.
    pub runs: u64,
    pub last: Option<LastSync>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Handle to a running background sync. Dropping it cancels the task.
#[derive(Debug)]
pub struct SyncScheduler {
    status: watch::Receiver<SyncStatus>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SyncScheduler {
    /// Sync now and then every `interval`. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn spawn<S, C>(reconciler: Reconciler<S, C>, interval: Duration) -> Self
    where
        S: ContentSource + 'static,
        C: Connectivity + 'static,
    {
        let (status_tx, status) = watch::channel(SyncStatus::default());
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(run(reconciler, interval, status_tx, Arc::clone(&wake)));
        tracing::debug!(interval_secs = interval.as_secs(), "Sync scheduler started");
        Self { status, wake, task }
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Run a sync as soon as the current one (if any) finishes.
    pub fn sync_now(&self) {
        self.wake.notify_one();
    }

    /// Stop syncing. A batch already being written still commits or rolls back whole.
    pub fn cancel(self) {
        self.task.abort();
        tracing::debug!("Sync scheduler cancelled");
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<S, C>(
    reconciler: Reconciler<S, C>,
    interval: Duration,
    status: watch::Sender<SyncStatus>,
    wake: Arc<Notify>,
) where
    S: ContentSource,
    C: Connectivity,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = wake.notified() => {}
        }

        let started = Utc::now();
        status.send_modify(|s| {
            s.running = true;
            s.last_attempt_at = Some(started);
        });

        let outcome = reconciler.sync().await;
        let succeeded = matches!(outcome, SyncOutcome::Updated(_));
        status.send_modify(|s| {
            s.running = false;
            s.runs += 1;
            s.last = Some(LastSync::from(&outcome));
            if succeeded {
                s.last_success_at = Some(Utc::now());
            }
        });
    }
}
