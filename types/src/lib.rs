//! Core domain types for Haven.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the engine.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

mod ids;
mod mode;
mod records;
mod rejection;
mod sanitize;
mod tokens;

pub use ids::{JournalSeq, RouteId, SessionId, SessionIdError};
pub use mode::{EnumKind, EnumParseError, Mode, NavEvent};
pub use records::{
    CachedContent, ContentCacheEntry, Intent, IntentKind, JournalEntry, JournalResolution,
    LocalEditPolicy, OperationalState, RejectionRecord, SessionOp, SessionRecord, SessionStatus,
    VersionedState,
};
pub use rejection::RejectionReason;
pub use sanitize::{FieldShape, sanitize_field, strip_control_sequences};
pub use tokens::{ConfirmationToken, TokenError, TriggerToken};
