//! Handle to the content cache file.
//!
//! The cache has one connection, shared by the reconciler and by whatever
//! records local edits. It never opens the engine database, so a batch in
//! flight here cannot hold up navigation.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use haven_config::StoreSettings;
use haven_store::{Record, Store, StoreError, WriteRetry, quarantine};
use haven_types::ContentCacheEntry;

#[derive(Debug, Clone)]
pub struct ContentCache {
    store: Arc<Mutex<Store>>,
    retry: WriteRetry,
}

impl ContentCache {
    /// Wrap an already open content store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            retry: WriteRetry::default(),
        }
    }

    /// Open the cache at `path`.
    ///
    /// Cached content is never authoritative, so a file that fails its
    /// integrity scan is moved aside and replaced by an empty cache.
    pub fn open(path: &Path, settings: &StoreSettings) -> Result<Self, StoreError> {
        let store = match Store::open_content(path, settings) {
            Ok(store) => store,
            Err(err) if err.is_corruption() => {
                let moved = quarantine(path, Utc::now())?;
                tracing::warn!(
                    quarantined = %moved.display(),
                    "Content cache failed its integrity scan; starting empty"
                );
                Store::open_content(path, settings)?
            }
            Err(err) => return Err(err),
        };
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
            retry: WriteRetry::from_settings(settings),
        })
    }

    pub fn entries(&self) -> Result<Vec<ContentCacheEntry>, StoreError> {
        self.lock().content_entries()
    }

    pub fn entry(&self, source_id: &str) -> Result<Option<ContentCacheEntry>, StoreError> {
        self.lock().content(source_id)
    }

    /// Source ids whose cache rows carry an unresolved local edit.
    pub fn unresolved_edits(&self) -> Result<Vec<String>, StoreError> {
        self.lock().unresolved_edits()
    }

    /// Mark a cached item as edited locally. Sync leaves it alone until resolved.
    pub fn mark_local_edit(&self, source_id: &str) -> Result<(), StoreError> {
        self.write(&Record::LocalEdit {
            source_id: source_id.to_string(),
            edited_at: Utc::now(),
        })?;
        tracing::debug!(source_id, "Local edit recorded");
        Ok(())
    }

    pub fn resolve_local_edit(&self, source_id: &str) -> Result<(), StoreError> {
        self.write(&Record::ResolveLocalEdit {
            source_id: source_id.to_string(),
        })
    }

    fn write(&self, record: &Record) -> Result<(), StoreError> {
        let mut store = self.lock();
        self.retry
            .run(|| store.write(std::slice::from_ref(record)))
            .map(|_| ())
    }

    pub(crate) fn retry(&self) -> WriteRetry {
        self.retry
    }

    pub(crate) fn shared(&self) -> Arc<Mutex<Store>> {
        Arc::clone(&self.store)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
