//! Opportunistic content sync for Haven.
//!
//! [`Reconciler::sync`] refreshes the reference-content cache from an HTTPS
//! JSON source when the device is online and does nothing otherwise. It runs
//! on its own connection and task, writes only the content partition, and
//! reports failures as values rather than errors. The cache lives in its own
//! file ([`ContentCache`]), apart from the engine database:
//!
//! ```text
//! online? ──no──► Skipped
//!    │
//! fetch (bounded retry, capped body) ──err──► Failed (logged)
//!    │
//! validate each item ──bad──► dropped, counted
//!    │
//! one transaction per batch ──► Updated(report)
//! ```

mod cache;
mod connectivity;
mod error;
mod reconciler;
pub mod retry;
mod scheduler;
mod source;
pub mod validate;

pub use cache::ContentCache;
pub use connectivity::{Connectivity, ConnectivityFlag};
pub use error::{SkipReason, SourceError, SyncFailure};
pub use reconciler::{Reconciler, ReconcilerOptions, SyncOutcome, SyncReport};
pub use scheduler::{LastSync, SyncScheduler, SyncStatus};
pub use source::{ContentSource, HttpContentSource, RemoteEnvelope};
