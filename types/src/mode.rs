//! Operational modes and the events that move between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level operational context the user is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Idle,
    Normal,
    CrisisDetected,
    NightWatch,
    Locked,
    Recovery,
    StandDown,
}

const MODE_PARSE_VALUES: &[&str] = &[
    "idle",
    "normal",
    "crisis_detected",
    "night_watch",
    "locked",
    "recovery",
    "stand_down",
];

impl Mode {
    pub const ALL: [Mode; 7] = [
        Mode::Idle,
        Mode::Normal,
        Mode::CrisisDetected,
        Mode::NightWatch,
        Mode::Locked,
        Mode::Recovery,
        Mode::StandDown,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Mode::Idle => "IDLE",
            Mode::Normal => "NORMAL",
            Mode::CrisisDetected => "CRISIS_DETECTED",
            Mode::NightWatch => "NIGHT_WATCH",
            Mode::Locked => "LOCKED",
            Mode::Recovery => "RECOVERY",
            Mode::StandDown => "STAND_DOWN",
        }
    }

    /// Modes where entry and exit require a user-attributable trigger.
    #[must_use]
    pub const fn is_containment(self) -> bool {
        matches!(self, Mode::CrisisDetected | Mode::NightWatch | Mode::Locked)
    }

    /// Modes that own a [`SessionRecord`](crate::SessionRecord) while active.
    #[must_use]
    pub const fn owns_sessions(self) -> bool {
        matches!(
            self,
            Mode::CrisisDetected | Mode::NightWatch | Mode::Locked | Mode::Recovery
        )
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "idle" => Ok(Mode::Idle),
            "normal" => Ok(Mode::Normal),
            "crisis_detected" => Ok(Mode::CrisisDetected),
            "night_watch" => Ok(Mode::NightWatch),
            "locked" => Ok(Mode::Locked),
            "recovery" => Ok(Mode::Recovery),
            "stand_down" => Ok(Mode::StandDown),
            _ => Err(EnumParseError::new(EnumKind::Mode, s, MODE_PARSE_VALUES)),
        }
    }
}

/// Events a caller may submit with a navigation request.
///
/// `Resume` is reserved for crash recovery; the guard refuses it from callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NavEvent {
    Activate,
    Navigate,
    EscalateCrisis,
    Deescalate,
    Lock,
    StandDown,
    AbandonAttempt,
    Resume,
}

const EVENT_PARSE_VALUES: &[&str] = &[
    "activate",
    "navigate",
    "escalate_crisis",
    "deescalate",
    "lock",
    "stand_down",
    "abandon_attempt",
    "resume",
];

impl NavEvent {
    pub const ALL: [NavEvent; 8] = [
        NavEvent::Activate,
        NavEvent::Navigate,
        NavEvent::EscalateCrisis,
        NavEvent::Deescalate,
        NavEvent::Lock,
        NavEvent::StandDown,
        NavEvent::AbandonAttempt,
        NavEvent::Resume,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            NavEvent::Activate => "ACTIVATE",
            NavEvent::Navigate => "NAVIGATE",
            NavEvent::EscalateCrisis => "ESCALATE_CRISIS",
            NavEvent::Deescalate => "DEESCALATE",
            NavEvent::Lock => "LOCK",
            NavEvent::StandDown => "STAND_DOWN",
            NavEvent::AbandonAttempt => "ABANDON_ATTEMPT",
            NavEvent::Resume => "RESUME",
        }
    }
}

impl fmt::Display for NavEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NavEvent {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "activate" => Ok(NavEvent::Activate),
            "navigate" => Ok(NavEvent::Navigate),
            "escalate_crisis" | "escalate" => Ok(NavEvent::EscalateCrisis),
            "deescalate" => Ok(NavEvent::Deescalate),
            "lock" => Ok(NavEvent::Lock),
            "stand_down" => Ok(NavEvent::StandDown),
            "abandon_attempt" | "back" => Ok(NavEvent::AbandonAttempt),
            "resume" => Ok(NavEvent::Resume),
            _ => Err(EnumParseError::new(EnumKind::NavEvent, s, EVENT_PARSE_VALUES)),
        }
    }
}

fn normalize(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace('-', "_")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumKind {
    Mode,
    NavEvent,
    SessionStatus,
    LocalEditPolicy,
}

impl EnumKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EnumKind::Mode => "mode",
            EnumKind::NavEvent => "navigation event",
            EnumKind::SessionStatus => "session status",
            EnumKind::LocalEditPolicy => "local edit policy",
        }
    }
}

impl fmt::Display for EnumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} value '{raw}'; expected one of: {expected:?}")]
pub struct EnumParseError {
    kind: EnumKind,
    raw: String,
    expected: &'static [&'static str],
}

impl EnumParseError {
    #[must_use]
    pub fn new(kind: EnumKind, raw: impl Into<String>, expected: &'static [&'static str]) -> Self {
        Self {
            kind,
            raw: raw.into(),
            expected,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EnumKind {
        self.kind
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_display_and_parse() {
        for mode in Mode::ALL {
            let parsed: Mode = mode.as_str().parse().unwrap();
            assert_eq!(parsed, mode);
        }
    }

    #[test]
    fn event_parse_accepts_aliases() {
        assert_eq!("back".parse::<NavEvent>().unwrap(), NavEvent::AbandonAttempt);
        assert_eq!(
            "escalate-crisis".parse::<NavEvent>().unwrap(),
            NavEvent::EscalateCrisis
        );
    }

    #[test]
    fn unknown_mode_reports_kind() {
        let err = "panic".parse::<Mode>().unwrap_err();
        assert_eq!(err.kind(), EnumKind::Mode);
        assert_eq!(err.raw(), "panic");
    }

    #[test]
    fn containment_modes() {
        let containment: Vec<Mode> = Mode::ALL
            .into_iter()
            .filter(|m| m.is_containment())
            .collect();
        assert_eq!(
            containment,
            vec![Mode::CrisisDetected, Mode::NightWatch, Mode::Locked]
        );
        assert!(Mode::Recovery.owns_sessions());
        assert!(!Mode::Normal.owns_sessions());
    }

    #[test]
    fn serde_uses_screaming_names() {
        assert_eq!(
            serde_json::to_string(&Mode::NightWatch).unwrap(),
            "\"NIGHT_WATCH\""
        );
        assert_eq!(
            serde_json::to_string(&NavEvent::AbandonAttempt).unwrap(),
            "\"ABANDON_ATTEMPT\""
        );
    }
}
