//! Crisis/Mode state machine.
//!
//! [`transition`] is a pure function of the current state, the event and a
//! [`TransitionContext`]. It never reads the clock or the store itself, so
//! replaying the same inputs always yields the same decision.
//!
//! # Transitions
//!
//! ```text
//! any            ── ESCALATE_CRISIS ──► CRISIS_DETECTED   trigger
//! IDLE           ── ACTIVATE ─────────► NORMAL
//! STAND_DOWN     ── ACTIVATE ─────────► NORMAL
//! CRISIS_DETECTED── LOCK ─────────────► LOCKED            trigger
//! NIGHT_WATCH    ── LOCK ─────────────► LOCKED            trigger
//! CRISIS_DETECTED── STAND_DOWN ───────► NIGHT_WATCH       trigger + confirmation
//! LOCKED         ── DEESCALATE ───────► NIGHT_WATCH       trigger + confirmation
//! NIGHT_WATCH    ── DEESCALATE ───────► RECOVERY          trigger + minimum duration
//! RECOVERY       ── STAND_DOWN ───────► STAND_DOWN
//! any            ── NAVIGATE ─────────► same              trigger inside containment
//! containment    ── ABANDON_ATTEMPT ──► rejected, logged
//! other          ── ABANDON_ATTEMPT ──► same (back navigation)
//! any            ── RESUME ───────────► same              crash recovery only
//! ```
//!
//! Every pair not listed is rejected with
//! [`RejectionReason::EventNotPermitted`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use haven_types::{
    ConfirmationToken, Mode, NavEvent, OperationalState, RejectionReason, TriggerToken,
};

/// Who is asking for the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Caller,
    /// Crash recovery re-entering the last committed state.
    Recovery,
}

/// Inputs to a transition besides the state and the event.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub origin: EventOrigin,
    pub trigger: Option<&'a TriggerToken>,
    pub confirmation: Option<&'a ConfirmationToken>,
    pub now: DateTime<Utc>,
    /// Least time spent in `NIGHT_WATCH` before `DEESCALATE` is honored.
    pub min_containment: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The event is accepted and the machine is in `to` afterwards. `to` may
    /// equal the current mode.
    Advance { to: Mode },
    Reject(RejectionReason),
}

impl Decision {
    #[must_use]
    pub fn target(&self) -> Option<Mode> {
        match self {
            Decision::Advance { to } => Some(*to),
            Decision::Reject(_) => None,
        }
    }
}

/// Decide what `event` does to `state`.
#[must_use]
pub fn transition(
    state: &OperationalState,
    event: NavEvent,
    ctx: &TransitionContext<'_>,
) -> Decision {
    let from = state.mode;

    let to = match (from, event) {
        (_, NavEvent::Resume) => match ctx.origin {
            EventOrigin::Recovery => return Decision::Advance { to: from },
            EventOrigin::Caller => return Decision::Reject(RejectionReason::ResumeReserved),
        },
        (_, NavEvent::EscalateCrisis) => Mode::CrisisDetected,
        (Mode::Idle | Mode::StandDown, NavEvent::Activate) => Mode::Normal,
        (Mode::CrisisDetected | Mode::NightWatch, NavEvent::Lock) => Mode::Locked,
        (Mode::CrisisDetected, NavEvent::StandDown) | (Mode::Locked, NavEvent::Deescalate) => {
            Mode::NightWatch
        }
        (Mode::NightWatch, NavEvent::Deescalate) => Mode::Recovery,
        (Mode::Recovery, NavEvent::StandDown) => Mode::StandDown,
        (_, NavEvent::AbandonAttempt) if from.is_containment() => {
            return Decision::Reject(RejectionReason::AbandonmentNotHonored { mode: from });
        }
        (_, NavEvent::AbandonAttempt | NavEvent::Navigate) => from,
        _ => {
            return Decision::Reject(RejectionReason::EventNotPermitted { mode: from, event });
        }
    };

    if (from.is_containment() || to.is_containment()) && ctx.trigger.is_none() {
        return Decision::Reject(RejectionReason::TriggerRequired);
    }

    match (from, to) {
        (Mode::CrisisDetected | Mode::Locked, Mode::NightWatch) if ctx.confirmation.is_none() => {
            return Decision::Reject(RejectionReason::ConfirmationRequired);
        }
        (Mode::NightWatch, Mode::Recovery) => {
            let remaining = containment_remaining(state.entered_at, ctx.now, ctx.min_containment);
            if !remaining.is_zero() {
                return Decision::Reject(RejectionReason::ContainmentDurationPending {
                    remaining_secs: remaining.as_secs().max(1),
                });
            }
        }
        _ => {}
    }

    Decision::Advance { to }
}

/// Time left before `min` has passed since `entered_at`.
///
/// A clock that reads earlier than `entered_at` counts as no time elapsed.
#[must_use]
pub fn containment_remaining(
    entered_at: DateTime<Utc>,
    now: DateTime<Utc>,
    min: Duration,
) -> Duration {
    let elapsed = (now - entered_at).to_std().unwrap_or(Duration::ZERO);
    min.saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_types::RouteId;

    const MIN: Duration = Duration::from_secs(1200);

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn state(mode: Mode, entered: i64) -> OperationalState {
        OperationalState {
            mode,
            route: RouteId::from("somewhere"),
            entered_at: at(entered),
            context: None,
        }
    }

    struct Tokens {
        trigger: TriggerToken,
        confirmation: ConfirmationToken,
    }

    fn tokens() -> Tokens {
        Tokens {
            trigger: TriggerToken::new("tap").unwrap(),
            confirmation: ConfirmationToken::new("confirm").unwrap(),
        }
    }

    fn ctx<'a>(
        trigger: Option<&'a TriggerToken>,
        confirmation: Option<&'a ConfirmationToken>,
        now: i64,
    ) -> TransitionContext<'a> {
        TransitionContext {
            origin: EventOrigin::Caller,
            trigger,
            confirmation,
            now: at(now),
            min_containment: MIN,
        }
    }

    #[test]
    fn activate_leaves_idle_and_stand_down() {
        for mode in [Mode::Idle, Mode::StandDown] {
            let decision = transition(&state(mode, 0), NavEvent::Activate, &ctx(None, None, 1));
            assert_eq!(decision, Decision::Advance { to: Mode::Normal });
        }
    }

    #[test]
    fn escalation_needs_a_trigger_from_anywhere() {
        let t = tokens();
        for mode in [
            Mode::Idle,
            Mode::Normal,
            Mode::CrisisDetected,
            Mode::NightWatch,
            Mode::Locked,
            Mode::Recovery,
            Mode::StandDown,
        ] {
            let s = state(mode, 0);
            assert_eq!(
                transition(&s, NavEvent::EscalateCrisis, &ctx(None, None, 1)),
                Decision::Reject(RejectionReason::TriggerRequired)
            );
            assert_eq!(
                transition(&s, NavEvent::EscalateCrisis, &ctx(Some(&t.trigger), None, 1)),
                Decision::Advance {
                    to: Mode::CrisisDetected
                }
            );
        }
    }

    #[test]
    fn stand_down_from_crisis_needs_confirmation() {
        let t = tokens();
        let s = state(Mode::CrisisDetected, 0);
        assert_eq!(
            transition(&s, NavEvent::StandDown, &ctx(Some(&t.trigger), None, 1)),
            Decision::Reject(RejectionReason::ConfirmationRequired)
        );
        assert_eq!(
            transition(
                &s,
                NavEvent::StandDown,
                &ctx(Some(&t.trigger), Some(&t.confirmation), 1)
            ),
            Decision::Advance {
                to: Mode::NightWatch
            }
        );
    }

    #[test]
    fn locked_deescalates_only_with_confirmation() {
        let t = tokens();
        let s = state(Mode::Locked, 0);
        assert_eq!(
            transition(&s, NavEvent::Deescalate, &ctx(Some(&t.trigger), None, 1)),
            Decision::Reject(RejectionReason::ConfirmationRequired)
        );
        assert_eq!(
            transition(
                &s,
                NavEvent::Deescalate,
                &ctx(Some(&t.trigger), Some(&t.confirmation), 1)
            ),
            Decision::Advance {
                to: Mode::NightWatch
            }
        );
    }

    #[test]
    fn night_watch_holds_until_minimum_duration() {
        let t = tokens();
        let s = state(Mode::NightWatch, 1_000);
        assert_eq!(
            transition(&s, NavEvent::Deescalate, &ctx(Some(&t.trigger), None, 1_300)),
            Decision::Reject(RejectionReason::ContainmentDurationPending {
                remaining_secs: 900
            })
        );
        assert_eq!(
            transition(&s, NavEvent::Deescalate, &ctx(Some(&t.trigger), None, 2_200)),
            Decision::Advance { to: Mode::Recovery }
        );
    }

    #[test]
    fn clock_running_backwards_does_not_shorten_containment() {
        let t = tokens();
        let s = state(Mode::NightWatch, 5_000);
        assert_eq!(
            transition(&s, NavEvent::Deescalate, &ctx(Some(&t.trigger), None, 10)),
            Decision::Reject(RejectionReason::ContainmentDurationPending {
                remaining_secs: 1200
            })
        );
    }

    #[test]
    fn abandonment_is_refused_in_containment_only() {
        for mode in [Mode::CrisisDetected, Mode::NightWatch, Mode::Locked] {
            assert_eq!(
                transition(&state(mode, 0), NavEvent::AbandonAttempt, &ctx(None, None, 1)),
                Decision::Reject(RejectionReason::AbandonmentNotHonored { mode })
            );
        }
        assert_eq!(
            transition(
                &state(Mode::Recovery, 0),
                NavEvent::AbandonAttempt,
                &ctx(None, None, 1)
            ),
            Decision::Advance { to: Mode::Recovery }
        );
    }

    #[test]
    fn navigate_inside_containment_needs_trigger() {
        let t = tokens();
        let s = state(Mode::Locked, 0);
        assert_eq!(
            transition(&s, NavEvent::Navigate, &ctx(None, None, 1)),
            Decision::Reject(RejectionReason::TriggerRequired)
        );
        assert_eq!(
            transition(&s, NavEvent::Navigate, &ctx(Some(&t.trigger), None, 1)),
            Decision::Advance { to: Mode::Locked }
        );
        assert_eq!(
            transition(&state(Mode::Normal, 0), NavEvent::Navigate, &ctx(None, None, 1)),
            Decision::Advance { to: Mode::Normal }
        );
    }

    #[test]
    fn resume_is_reserved_for_recovery() {
        let s = state(Mode::Locked, 0);
        assert_eq!(
            transition(&s, NavEvent::Resume, &ctx(None, None, 1)),
            Decision::Reject(RejectionReason::ResumeReserved)
        );
        let recovery = TransitionContext {
            origin: EventOrigin::Recovery,
            ..ctx(None, None, 1)
        };
        assert_eq!(
            transition(&s, NavEvent::Resume, &recovery),
            Decision::Advance { to: Mode::Locked }
        );
    }

    #[test]
    fn unlisted_pairs_are_not_permitted() {
        let t = tokens();
        let cases = [
            (Mode::Idle, NavEvent::Lock),
            (Mode::Normal, NavEvent::Deescalate),
            (Mode::Normal, NavEvent::Activate),
            (Mode::Locked, NavEvent::StandDown),
            (Mode::Recovery, NavEvent::Lock),
            (Mode::CrisisDetected, NavEvent::Activate),
        ];
        for (mode, event) in cases {
            assert_eq!(
                transition(&state(mode, 0), event, &ctx(Some(&t.trigger), None, 1)),
                Decision::Reject(RejectionReason::EventNotPermitted { mode, event }),
                "{mode} / {event}"
            );
        }
    }

    #[test]
    fn replaying_the_same_events_is_deterministic() {
        let t = tokens();
        let events = [
            (NavEvent::Activate, 10),
            (NavEvent::EscalateCrisis, 20),
            (NavEvent::Lock, 30),
            (NavEvent::Deescalate, 40),
            (NavEvent::Deescalate, 100),
            (NavEvent::Deescalate, 2_000),
            (NavEvent::StandDown, 2_100),
            (NavEvent::Activate, 2_200),
        ];
        let run = || {
            let mut s = state(Mode::Idle, 0);
            let mut trace = Vec::new();
            for (event, now) in events {
                let decision = transition(
                    &s,
                    event,
                    &ctx(Some(&t.trigger), Some(&t.confirmation), now),
                );
                if let Decision::Advance { to } = decision {
                    if to != s.mode {
                        s.entered_at = at(now);
                    }
                    s.mode = to;
                }
                trace.push(s.mode);
            }
            trace
        };
        let first = run();
        assert_eq!(first, run());
        assert_eq!(
            first,
            vec![
                Mode::Normal,
                Mode::CrisisDetected,
                Mode::Locked,
                Mode::NightWatch,
                Mode::NightWatch,
                Mode::Recovery,
                Mode::StandDown,
                Mode::Normal,
            ]
        );
    }

    #[test]
    fn remaining_saturates_at_zero() {
        assert_eq!(containment_remaining(at(0), at(5_000), MIN), Duration::ZERO);
        assert_eq!(
            containment_remaining(at(0), at(200), MIN),
            Duration::from_secs(1_000)
        );
    }
}
