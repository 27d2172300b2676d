//! Durable record shapes shared by the store, the engine and the reconciler.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mode::{EnumKind, EnumParseError};
use crate::{ConfirmationToken, JournalSeq, Mode, NavEvent, RejectionReason, RouteId, SessionId,
    TriggerToken};

// ============================================================================
// Operational state
// ============================================================================

/// The single process-wide record routing decisions are made against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationalState {
    pub mode: Mode,
    pub route: RouteId,
    /// When the current mode was entered. Route changes inside a mode keep it.
    pub entered_at: DateTime<Utc>,
    /// The open session owned by the current mode, if any.
    pub context: Option<SessionId>,
}

impl OperationalState {
    #[must_use]
    pub fn initial(route: RouteId, now: DateTime<Utc>) -> Self {
        Self {
            mode: Mode::Idle,
            route,
            entered_at: now,
            context: None,
        }
    }
}

/// An [`OperationalState`] together with the journal entry that produced it.
///
/// Every overwrite of the state is a new version; versions are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedState {
    pub version: JournalSeq,
    pub state: OperationalState,
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
    Recovered,
}

const SESSION_STATUS_VALUES: &[&str] = &["active", "completed", "abandoned", "recovered"];

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Abandoned => "ABANDONED",
            SessionStatus::Recovered => "RECOVERED",
        }
    }

    /// A recovered session is still the live session of its mode.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Recovered)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "abandoned" => Ok(SessionStatus::Abandoned),
            "recovered" => Ok(SessionStatus::Recovered),
            _ => Err(EnumParseError::new(
                EnumKind::SessionStatus,
                s,
                SESSION_STATUS_VALUES,
            )),
        }
    }
}

/// One user-initiated unit of work within a mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint_at: DateTime<Utc>,
    /// Mode-specific data; opaque to the engine.
    pub payload: serde_json::Value,
    pub status: SessionStatus,
}

/// A session mutation carried inside a journal intent.
///
/// Every op is idempotent when applied, so replaying an intent twice leaves
/// the same rows behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SessionOp {
    Open {
        id: SessionId,
        mode: Mode,
        at: DateTime<Utc>,
    },
    Checkpoint {
        id: SessionId,
        at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Close {
        id: SessionId,
        status: SessionStatus,
        at: DateTime<Utc>,
    },
    MarkRecovered {
        id: SessionId,
        at: DateTime<Utc>,
    },
}

// ============================================================================
// Journal
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// First launch: seeds the IDLE state.
    Initialize,
    /// A guard-approved navigation request.
    Transition,
    /// A mode persisting its session payload.
    Checkpoint,
    /// Crash recovery re-entering the last committed state.
    Resume,
    /// Seeding a fresh store with state salvaged from a corrupt one.
    Restore,
}

impl IntentKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            IntentKind::Initialize => "initialize",
            IntentKind::Transition => "transition",
            IntentKind::Checkpoint => "checkpoint",
            IntentKind::Resume => "resume",
            IntentKind::Restore => "restore",
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to re-apply a state-affecting mutation deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<NavEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<ConfirmationToken>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<SessionOp>,
}

impl Intent {
    #[must_use]
    pub fn new(kind: IntentKind) -> Self {
        Self {
            kind,
            event: None,
            trigger: None,
            confirmation: None,
            sessions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_event(mut self, event: NavEvent) -> Self {
        self.event = Some(event);
        self
    }

    #[must_use]
    pub fn with_tokens(
        mut self,
        trigger: Option<TriggerToken>,
        confirmation: Option<ConfirmationToken>,
    ) -> Self {
        self.trigger = trigger;
        self.confirmation = confirmation;
        self
    }

    #[must_use]
    pub fn with_session_op(mut self, op: SessionOp) -> Self {
        self.sessions.push(op);
        self
    }
}

/// How an uncommitted entry was resolved without being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalResolution {
    /// Applying failed at runtime; the prior state stood and the entry is never replayed.
    Aborted,
    /// Found on open below the last committed entry; replaying it would regress state.
    Superseded,
}

impl JournalResolution {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            JournalResolution::Aborted => "aborted",
            JournalResolution::Superseded => "superseded",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "aborted" => Some(JournalResolution::Aborted),
            "superseded" => Some(JournalResolution::Superseded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: JournalSeq,
    pub intent: Intent,
    /// The full state the intent produces once applied.
    pub target: OperationalState,
    pub recorded_at: DateTime<Utc>,
    pub committed: bool,
    pub resolution: Option<JournalResolution>,
}

impl JournalEntry {
    /// Pending entries are the ones crash repair must replay.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.committed && self.resolution.is_none()
    }
}

// ============================================================================
// Rejections
// ============================================================================

/// A durably logged rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub id: i64,
    pub mode: Mode,
    pub current_route: RouteId,
    pub requested_route: RouteId,
    pub event: NavEvent,
    pub reason: RejectionReason,
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// Content cache
// ============================================================================

/// Sanitized remote reference content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedContent {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// When the source says it last changed the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCacheEntry {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub validated_at: DateTime<Utc>,
    pub content: CachedContent,
    /// Hex SHA-256 of the canonical sanitized content.
    pub content_hash: String,
}

/// Tie-break when a remote update arrives for a row with an unresolved local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalEditPolicy {
    /// Drop the remote update; the local edit stays authoritative.
    #[default]
    KeepLocal,
    /// Park the remote update and apply it once the local edit is resolved.
    Defer,
}

const LOCAL_EDIT_POLICY_VALUES: &[&str] = &["keep_local", "defer"];

impl FromStr for LocalEditPolicy {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_local" | "local" => Ok(LocalEditPolicy::KeepLocal),
            "defer" => Ok(LocalEditPolicy::Defer),
            _ => Err(EnumParseError::new(
                EnumKind::LocalEditPolicy,
                s,
                LOCAL_EDIT_POLICY_VALUES,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn intent_serialization_omits_empty_fields() {
        let intent = Intent::new(IntentKind::Initialize);
        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "initialize" }));
    }

    #[test]
    fn intent_round_trips_with_session_ops() {
        let id = SessionId::generate();
        let intent = Intent::new(IntentKind::Transition)
            .with_event(NavEvent::Lock)
            .with_tokens(Some(TriggerToken::new("tap:lock").unwrap()), None)
            .with_session_op(SessionOp::Close {
                id: id.clone(),
                status: SessionStatus::Abandoned,
                at: at(10),
            })
            .with_session_op(SessionOp::Open {
                id,
                mode: Mode::Locked,
                at: at(10),
            });
        let json = serde_json::to_string(&intent).unwrap();
        let parsed: Intent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, intent);
    }

    #[test]
    fn pending_excludes_resolved_entries() {
        let mut entry = JournalEntry {
            seq: JournalSeq::new(1),
            intent: Intent::new(IntentKind::Initialize),
            target: OperationalState::initial(RouteId::from("welcome"), at(0)),
            recorded_at: at(0),
            committed: false,
            resolution: None,
        };
        assert!(entry.is_pending());
        entry.resolution = Some(JournalResolution::Aborted);
        assert!(!entry.is_pending());
    }

    #[test]
    fn recovered_sessions_are_open() {
        assert!(SessionStatus::Recovered.is_open());
        assert!(!SessionStatus::Abandoned.is_open());
        assert_eq!(
            "COMPLETED".parse::<SessionStatus>().unwrap(),
            SessionStatus::Completed
        );
    }

    #[test]
    fn local_edit_policy_parses() {
        assert_eq!(
            "defer".parse::<LocalEditPolicy>().unwrap(),
            LocalEditPolicy::Defer
        );
        assert_eq!(
            "keep-local".parse::<LocalEditPolicy>().unwrap(),
            LocalEditPolicy::KeepLocal
        );
        assert!("newest".parse::<LocalEditPolicy>().is_err());
    }
}
