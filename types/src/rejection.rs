//! Reasons a navigation request can be turned down.
//!
//! A rejection is a designed outcome, not an error. Every variant carries a
//! stable code for the rejection log and a calm message the rendering layer
//! may show as-is.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Mode, NavEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The target route is not in the route table.
    UnknownRoute,
    /// The current mode may not request the target route.
    RouteNotPermitted { mode: Mode },
    /// The transition would land in a mode the target route does not render in.
    RouteModeMismatch { mode: Mode },
    /// The state machine has no transition for this event in this mode.
    EventNotPermitted { mode: Mode, event: NavEvent },
    /// `RESUME` is issued by crash recovery only.
    ResumeReserved,
    /// Containment transitions need a user-attributable trigger token.
    TriggerRequired,
    /// The route or transition needs an explicit confirmation token.
    ConfirmationRequired,
    /// The minimum containment duration has not elapsed yet.
    ContainmentDurationPending { remaining_secs: u64 },
    /// Abandonment of a containment mode is recorded but never honored.
    AbandonmentNotHonored { mode: Mode },
    /// The current route does not allow back navigation.
    BackNotAllowed,
    /// The store could not commit the transition; the prior state stands.
    PersistenceFailure,
}

impl RejectionReason {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownRoute => "unknown_route",
            Self::RouteNotPermitted { .. } => "route_not_permitted",
            Self::RouteModeMismatch { .. } => "route_mode_mismatch",
            Self::EventNotPermitted { .. } => "event_not_permitted",
            Self::ResumeReserved => "resume_reserved",
            Self::TriggerRequired => "trigger_required",
            Self::ConfirmationRequired => "confirmation_required",
            Self::ContainmentDurationPending { .. } => "containment_duration_pending",
            Self::AbandonmentNotHonored { .. } => "abandonment_not_honored",
            Self::BackNotAllowed => "back_not_allowed",
            Self::PersistenceFailure => "persistence_failure",
        }
    }

    /// Whether the rejection came from containment policy rather than storage.
    #[must_use]
    pub const fn is_containment(&self) -> bool {
        !matches!(self, Self::PersistenceFailure)
    }

    /// Calm, non-technical text for the rendering layer.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::UnknownRoute
            | Self::RouteNotPermitted { .. }
            | Self::RouteModeMismatch { .. } => {
                "That screen isn't available right now. You're safe where you are.".to_string()
            }
            Self::EventNotPermitted { .. } | Self::ResumeReserved => {
                "Let's stay here for now. Nothing has changed.".to_string()
            }
            Self::TriggerRequired => "Tap the button when you're ready to continue.".to_string(),
            Self::ConfirmationRequired => {
                "Please confirm before we move on. Take your time.".to_string()
            }
            Self::ContainmentDurationPending { remaining_secs } => {
                let minutes = remaining_secs.div_ceil(60).max(1);
                format!(
                    "Let's stay with this a little longer, about {minutes} more minute{}.",
                    if minutes == 1 { "" } else { "s" }
                )
            }
            Self::AbandonmentNotHonored { .. } => {
                "You're still here and support is still here. When you're ready, choose how to continue."
                    .to_string()
            }
            Self::BackNotAllowed => "This screen stays open for now.".to_string(),
            Self::PersistenceFailure => {
                "Something didn't save, so nothing has changed. Please try again in a moment."
                    .to_string()
            }
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RouteNotPermitted { mode } | Self::RouteModeMismatch { mode } => {
                write!(f, "{} (mode {mode})", self.code())
            }
            Self::EventNotPermitted { mode, event } => {
                write!(f, "{} ({event} in {mode})", self.code())
            }
            Self::ContainmentDurationPending { remaining_secs } => {
                write!(f, "{} ({remaining_secs}s remaining)", self.code())
            }
            Self::AbandonmentNotHonored { mode } => write!(f, "{} (mode {mode})", self.code()),
            _ => f.write_str(self.code()),
        }
    }
}
