//! Durable storage for Haven.
//!
//! - [`Store`]: transactional record store on SQLite (WAL, `synchronous=FULL`)
//! - [`Journal`]: write-ahead log of state-affecting intents
//! - [`WriteRetry`]: bounded backoff for [`StoreError::WriteTimeout`]
//! - [`salvage`]: best-effort recovery of the last committed state from a
//!   file that failed its integrity scan

mod error;
mod journal;
mod retry;
mod salvage;
mod sqlite;
mod store;

pub use error::StoreError;
pub use journal::{Journal, JournalStats};
pub use retry::WriteRetry;
pub use salvage::{SalvagedState, salvage};
pub use sqlite::{IntegrityScan, quarantine};
pub use store::{CommitOutcome, NewRejection, Query, Record, Rows, Store, StoreTransaction};
