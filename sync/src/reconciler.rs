//! Reconciling remote content into the local cache.
//!
//! The reconciler only ever writes the content partition: cache rows,
//! deferred remote rows and their bookkeeping. Each batch is one
//! transaction, so an interrupted sync leaves whole rows or nothing.

use std::sync::PoisonError;

use chrono::{DateTime, Utc};
use haven_config::Settings;
use haven_store::{CommitOutcome, Record, Store, StoreError, StoreTransaction, WriteRetry};
use haven_types::{ContentCacheEntry, LocalEditPolicy};

use crate::validate::{ValidatedItem, validate_items};
use crate::{Connectivity, ContentCache, ContentSource, SkipReason, SyncFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerOptions {
    pub enabled: bool,
    /// Items written per transaction.
    pub batch_size: usize,
    pub local_edit_policy: LocalEditPolicy,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ReconcilerOptions {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            enabled: settings.sync.enabled,
            batch_size: settings.sync.batch_size,
            local_edit_policy: settings.policy.local_edit_policy,
        }
    }
}

/// Counts from one completed sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Items in the remote envelope.
    pub received: usize,
    /// Items dropped by validation.
    pub rejected: usize,
    /// Cache rows inserted or replaced.
    pub written: usize,
    /// Items whose content matched the cache.
    pub unchanged: usize,
    /// Updates dropped because the row has an unresolved local edit.
    pub kept_local: usize,
    /// Updates parked behind an unresolved local edit.
    pub deferred: usize,
    /// Parked updates applied now that their edit is resolved.
    pub applied_deferred: usize,
    /// Transactions that wrote something.
    pub batches: usize,
}

impl SyncReport {
    /// Rows this sync changed, in either table.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.written + self.deferred + self.applied_deferred
    }

    fn absorb(&mut self, tally: SyncReport) {
        self.written += tally.written;
        self.unchanged += tally.unchanged;
        self.kept_local += tally.kept_local;
        self.deferred += tally.deferred;
        self.applied_deferred += tally.applied_deferred;
        self.batches += tally.batches;
    }
}

#[derive(Debug)]
pub enum SyncOutcome {
    Updated(SyncReport),
    Skipped(SkipReason),
    Failed(SyncFailure),
}

impl SyncOutcome {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Updated(_) => "updated",
            SyncOutcome::Skipped(_) => "skipped",
            SyncOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemAction {
    Write,
    Unchanged,
    KeepLocal,
    Defer,
}

pub struct Reconciler<S, C> {
    cache: ContentCache,
    source: S,
    connectivity: C,
    options: ReconcilerOptions,
}

impl<S, C> std::fmt::Debug for Reconciler<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<S: ContentSource, C: Connectivity> Reconciler<S, C> {
    pub fn new(
        cache: ContentCache,
        source: S,
        connectivity: C,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            cache,
            source,
            connectivity,
            options,
        }
    }

    /// The cache this reconciler writes, for recording local edits.
    #[must_use]
    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    #[must_use]
    pub fn options(&self) -> &ReconcilerOptions {
        &self.options
    }

    /// Fetch, validate and cache remote content.
    ///
    /// Returns `Skipped` at once when offline. Failures are logged here and
    /// returned as values; nothing in this path panics or blocks navigation.
    pub async fn sync(&self) -> SyncOutcome {
        if !self.options.enabled {
            return SyncOutcome::Skipped(SkipReason::Disabled);
        }
        if !self.connectivity.is_online() {
            tracing::debug!("Offline; skipping content sync");
            return SyncOutcome::Skipped(SkipReason::Offline);
        }

        let envelope = match self.source.fetch().await {
            Ok(envelope) => envelope,
            Err(failure) => return self.failed(failure),
        };

        let received = envelope.items.len();
        let validation = validate_items(envelope.items);
        let report = SyncReport {
            received,
            rejected: validation.rejected.len(),
            ..SyncReport::default()
        };

        let store = self.cache.shared();
        let options = self.options;
        let retry = self.cache.retry();
        let items = validation.items;
        // The blocking task owns its transactions; aborting this future
        // lets the current batch finish or roll back on its own.
        let applied = tokio::task::spawn_blocking(move || {
            let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
            apply(&mut store, &retry, items, &options, Utc::now())
        })
        .await;

        match applied {
            Ok(Ok(tally)) => {
                let mut report = report;
                report.absorb(tally);
                tracing::info!(
                    received = report.received,
                    rejected = report.rejected,
                    written = report.written,
                    unchanged = report.unchanged,
                    kept_local = report.kept_local,
                    deferred = report.deferred,
                    applied_deferred = report.applied_deferred,
                    "Content sync complete"
                );
                SyncOutcome::Updated(report)
            }
            Ok(Err(err)) => self.failed(SyncFailure::Store(err)),
            Err(_) => self.failed(SyncFailure::Interrupted),
        }
    }

    fn failed(&self, failure: SyncFailure) -> SyncOutcome {
        tracing::warn!(code = failure.code(), "Content sync failed: {failure}");
        SyncOutcome::Failed(failure)
    }
}

fn apply(
    store: &mut Store,
    retry: &WriteRetry,
    items: Vec<ValidatedItem>,
    options: &ReconcilerOptions,
    now: DateTime<Utc>,
) -> Result<SyncReport, StoreError> {
    let mut report = retry.run(|| apply_deferred(&mut *store, now))?;

    for batch in items.chunks(options.batch_size.max(1)) {
        let tally = retry.run(|| apply_batch(&mut *store, batch, options.local_edit_policy, now))?;
        report.absorb(tally);
    }
    Ok(report)
}

/// Move parked updates into the cache once their local edit is resolved.
fn apply_deferred(store: &mut Store, now: DateTime<Utc>) -> Result<SyncReport, StoreError> {
    let mut tx = store.begin_transaction()?;
    let mut records = Vec::new();
    let mut tally = SyncReport::default();

    for pending in tx.pending_remote_entries()? {
        if tx.has_unresolved_edit(&pending.source_id)? {
            continue;
        }
        let source_id = pending.source_id.clone();
        let cached_hash = tx.content(&source_id)?.map(|entry| entry.content_hash);
        if cached_hash.as_deref() != Some(pending.content_hash.as_str()) {
            records.push(Record::Content(ContentCacheEntry {
                validated_at: now,
                ..pending
            }));
            tally.applied_deferred += 1;
        }
        records.push(Record::ClearPendingRemote { source_id });
    }

    commit_batch(tx, &records)?;
    if !records.is_empty() {
        tally.batches = 1;
    }
    Ok(tally)
}

fn apply_batch(
    store: &mut Store,
    batch: &[ValidatedItem],
    policy: LocalEditPolicy,
    now: DateTime<Utc>,
) -> Result<SyncReport, StoreError> {
    let mut tx = store.begin_transaction()?;
    let mut records = Vec::new();
    let mut tally = SyncReport::default();

    for item in batch {
        match decide(&tx, item, policy)? {
            ItemAction::Unchanged => tally.unchanged += 1,
            ItemAction::KeepLocal => {
                tracing::debug!(
                    source_id = %item.source_id,
                    "Remote update kept out by local edit"
                );
                tally.kept_local += 1;
            }
            ItemAction::Defer => {
                records.push(Record::PendingRemote(item.clone().into_entry(now)));
                tally.deferred += 1;
            }
            ItemAction::Write => {
                records.push(Record::Content(item.clone().into_entry(now)));
                tally.written += 1;
            }
        }
    }

    commit_batch(tx, &records)?;
    if !records.is_empty() {
        tally.batches = 1;
    }
    Ok(tally)
}

/// Decided inside the batch transaction, which holds the write lock.
fn decide(
    tx: &StoreTransaction<'_>,
    item: &ValidatedItem,
    policy: LocalEditPolicy,
) -> Result<ItemAction, StoreError> {
    let same_hash = |entry: Option<ContentCacheEntry>| {
        entry.is_some_and(|entry| entry.content_hash == item.content_hash)
    };

    if tx.has_unresolved_edit(&item.source_id)? {
        return Ok(match policy {
            LocalEditPolicy::KeepLocal => ItemAction::KeepLocal,
            LocalEditPolicy::Defer if same_hash(tx.pending_remote(&item.source_id)?) => {
                ItemAction::Unchanged
            }
            LocalEditPolicy::Defer => ItemAction::Defer,
        });
    }

    if same_hash(tx.content(&item.source_id)?) {
        Ok(ItemAction::Unchanged)
    } else {
        Ok(ItemAction::Write)
    }
}

/// Commit `records`, or roll back when there is nothing to write.
fn commit_batch(mut tx: StoreTransaction<'_>, records: &[Record]) -> Result<(), StoreError> {
    if records.is_empty() {
        return tx.rollback();
    }
    tx.write(records)?;
    match tx.commit()? {
        CommitOutcome::Committed => Ok(()),
        CommitOutcome::Aborted => Err(StoreError::TransactionAborted),
    }
}
