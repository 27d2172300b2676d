//! Navigation guard.
//!
//! Every request is checked against the route table and the state machine,
//! then journaled and committed. A request only reports `Approved` after its
//! commit is durable; every other path logs a rejection and leaves the prior
//! state authoritative.

use chrono::{DateTime, Utc};
use haven_store::{NewRejection, Record, StoreError};
use haven_types::{
    ConfirmationToken, FieldShape, Intent, IntentKind, JournalResolution, JournalSeq, Mode,
    NavEvent, OperationalState, RejectionReason, RouteId, SessionId, SessionOp, SessionStatus,
    TriggerToken, VersionedState, sanitize_field,
};
use serde_json::Value;

use crate::machine::{self, Decision, EventOrigin, TransitionContext};
use crate::routes::RouteTable;
use crate::{Engine, EngineError};

const MAX_LOGGED_ROUTE_CHARS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationRequest {
    pub target: RouteId,
    pub event: NavEvent,
    pub trigger: Option<TriggerToken>,
    pub confirmation: Option<ConfirmationToken>,
}

impl NavigationRequest {
    #[must_use]
    pub fn new(target: impl Into<RouteId>, event: NavEvent) -> Self {
        Self {
            target: target.into(),
            event,
            trigger: None,
            confirmation: None,
        }
    }

    #[must_use]
    pub fn with_trigger(mut self, trigger: TriggerToken) -> Self {
        self.trigger = Some(trigger);
        self
    }

    #[must_use]
    pub fn with_confirmation(mut self, confirmation: ConfirmationToken) -> Self {
        self.confirmation = Some(confirmation);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationOutcome {
    /// The transition is committed; `route` is now displayed in `mode`.
    Approved { route: RouteId, mode: Mode },
    /// Nothing changed. The rejection has been logged.
    Rejected(RejectionReason),
}

impl NavigationOutcome {
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, NavigationOutcome::Approved { .. })
    }

    #[must_use]
    pub fn rejection(&self) -> Option<&RejectionReason> {
        match self {
            NavigationOutcome::Approved { .. } => None,
            NavigationOutcome::Rejected(reason) => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Saved { session: SessionId, seq: JournalSeq },
    /// The current mode has no open session to write to.
    NoOpenSession,
}

/// A transition that passed every check and has not touched storage yet.
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    pub(crate) intent: Intent,
    pub(crate) target: OperationalState,
}

/// Proof that a transition's intent is durably journaled.
///
/// Only [`Engine::stage`] creates one, and only after the append is flushed.
/// Dropping it without [`Engine::commit_staged`] leaves a pending entry that
/// the next open replays.
#[derive(Debug)]
#[must_use]
pub(crate) struct StagedTransition {
    seq: JournalSeq,
    intent: Intent,
    target: OperationalState,
}

impl StagedTransition {
    pub(crate) fn seq(&self) -> JournalSeq {
        self.seq
    }
}

/// Records applied alongside marking `seq` committed.
///
/// Checkpoints leave the operational state untouched, so they add no state version.
pub(crate) fn commit_records(
    seq: JournalSeq,
    intent: &Intent,
    target: &OperationalState,
) -> Vec<Record> {
    let mut records = Vec::with_capacity(intent.sessions.len() + 1);
    if intent.kind != IntentKind::Checkpoint {
        records.push(Record::StateVersion(VersionedState {
            version: seq,
            state: target.clone(),
        }));
    }
    records.extend(intent.sessions.iter().cloned().map(Record::Session));
    records
}

impl Engine {
    /// Evaluate `request` and, if every check passes, journal and commit it.
    ///
    /// Requests are served one at a time; `&mut self` rules out a second
    /// transition while one is in flight.
    pub fn request_transition(&mut self, request: &NavigationRequest) -> NavigationOutcome {
        let now = self.clock.now();

        if let Err(err) = self.settle_pending_abort() {
            tracing::warn!("Could not resolve earlier aborted entry: {err}");
            return self.reject(request, RejectionReason::PersistenceFailure, now);
        }

        let plan = match self.evaluate(request, now) {
            Ok(plan) => plan,
            Err(reason) => return self.reject(request, reason, now),
        };

        let staged = match self.stage(plan) {
            Ok(staged) => staged,
            Err(err) => {
                tracing::warn!(event = %request.event, "Journal append failed: {err}");
                return self.reject(request, RejectionReason::PersistenceFailure, now);
            }
        };
        let seq = staged.seq();

        if let Err(err) = self.commit_staged(staged) {
            tracing::warn!(%seq, event = %request.event, "Journal commit failed: {err}");
            return self.reject(request, RejectionReason::PersistenceFailure, now);
        }

        let state = &self.state.state;
        tracing::info!(
            %seq,
            event = %request.event,
            mode = %state.mode,
            route = %state.route,
            "Navigation approved"
        );
        NavigationOutcome::Approved {
            route: state.route.clone(),
            mode: state.mode,
        }
    }

    /// Persist `payload` into the current mode's open session.
    pub fn checkpoint(&mut self, payload: Value) -> Result<CheckpointOutcome, EngineError> {
        self.settle_pending_abort()?;
        let Some(session) = self.state.state.context.clone() else {
            return Ok(CheckpointOutcome::NoOpenSession);
        };

        let now = self.clock.now();
        let intent = Intent::new(IntentKind::Checkpoint).with_session_op(SessionOp::Checkpoint {
            id: session.clone(),
            at: now,
            payload: Some(payload),
        });
        let staged = self.stage(Plan {
            intent,
            target: self.state.state.clone(),
        })?;
        let seq = staged.seq();
        self.commit_staged(staged)?;

        tracing::debug!(%seq, %session, "Session checkpointed");
        Ok(CheckpointOutcome::Saved { session, seq })
    }

    /// Run every check against the current state without touching storage.
    pub(crate) fn evaluate(
        &self,
        request: &NavigationRequest,
        now: DateTime<Utc>,
    ) -> Result<Plan, RejectionReason> {
        let current = &self.state.state;
        let route = self
            .routes
            .lookup(&request.target)
            .ok_or(RejectionReason::UnknownRoute)?;

        let ctx = TransitionContext {
            origin: EventOrigin::Caller,
            trigger: request.trigger.as_ref(),
            confirmation: request.confirmation.as_ref(),
            now,
            min_containment: self.options.min_containment,
        };
        let decision = machine::transition(current, request.event, &ctx);

        // Abandonment inside containment is answered the same way whatever the target.
        if let Decision::Reject(reason @ RejectionReason::AbandonmentNotHonored { .. }) = &decision
        {
            return Err(reason.clone());
        }

        let escalation = request.event == NavEvent::EscalateCrisis && RouteTable::is_panic(route);
        if !escalation && !route.allows_from(current.mode) {
            return Err(RejectionReason::RouteNotPermitted { mode: current.mode });
        }

        let to = match decision {
            Decision::Advance { to } => to,
            Decision::Reject(reason) => return Err(reason),
        };

        if request.event == NavEvent::AbandonAttempt {
            let back_allowed = self
                .routes
                .lookup(&current.route)
                .is_some_and(|route| route.allow_back);
            if !back_allowed {
                return Err(RejectionReason::BackNotAllowed);
            }
        }

        if route.requires_confirmation && request.confirmation.is_none() {
            return Err(RejectionReason::ConfirmationRequired);
        }

        if !route.renders(to) {
            return Err(RejectionReason::RouteModeMismatch { mode: to });
        }

        Ok(self.plan(request, to, now))
    }

    /// Build the intent and target state, including session bookkeeping.
    ///
    /// Leaving a session-owning mode closes its session. The session is
    /// `COMPLETED` when the request carries a confirmation or hands the
    /// person on to `LOCKED`, which contains them more tightly than the mode
    /// being left. Any other unconfirmed exit closes it `ABANDONED`. Entering
    /// a session-owning mode opens a new session; staying inside one
    /// checkpoints it.
    fn plan(&self, request: &NavigationRequest, to: Mode, now: DateTime<Utc>) -> Plan {
        let current = &self.state.state;
        let mut intent = Intent::new(IntentKind::Transition)
            .with_event(request.event)
            .with_tokens(request.trigger.clone(), request.confirmation.clone());

        let mode_changed = to != current.mode;
        let context = if mode_changed {
            if let Some(id) = &current.context {
                let status = if request.confirmation.is_some() || to == Mode::Locked {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Abandoned
                };
                intent = intent.with_session_op(SessionOp::Close {
                    id: id.clone(),
                    status,
                    at: now,
                });
            }
            if to.owns_sessions() {
                let id = SessionId::generate();
                intent = intent.with_session_op(SessionOp::Open {
                    id: id.clone(),
                    mode: to,
                    at: now,
                });
                Some(id)
            } else {
                None
            }
        } else {
            if let Some(id) = &current.context {
                intent = intent.with_session_op(SessionOp::Checkpoint {
                    id: id.clone(),
                    at: now,
                    payload: None,
                });
            }
            current.context.clone()
        };

        let target = OperationalState {
            mode: to,
            route: request.target.clone(),
            entered_at: if mode_changed { now } else { current.entered_at },
            context,
        };
        Plan { intent, target }
    }

    /// Append the plan's intent to the journal.
    pub(crate) fn stage(&mut self, plan: Plan) -> Result<StagedTransition, StoreError> {
        let now = self.clock.now();
        let store = &mut self.store;
        let seq = self
            .retry
            .run(|| store.journal().append(&plan.intent, &plan.target, now))?;
        Ok(StagedTransition {
            seq,
            intent: plan.intent,
            target: plan.target,
        })
    }

    /// Apply a staged transition and mark it committed in one transaction.
    ///
    /// On failure the entry is resolved as aborted and the prior state stands.
    pub(crate) fn commit_staged(&mut self, staged: StagedTransition) -> Result<(), StoreError> {
        let now = self.clock.now();
        let records = commit_records(staged.seq, &staged.intent, &staged.target);
        let store = &mut self.store;
        let committed = self
            .retry
            .run(|| store.journal().commit(staged.seq, &records, now));

        match committed {
            Ok(()) => {
                if staged.intent.kind != IntentKind::Checkpoint {
                    self.state = VersionedState {
                        version: staged.seq,
                        state: staged.target,
                    };
                }
                Ok(())
            }
            Err(err) => {
                self.abort(staged.seq);
                Err(err)
            }
        }
    }

    fn abort(&mut self, seq: JournalSeq) {
        if let Err(err) = self.store.journal().resolve(seq, JournalResolution::Aborted) {
            tracing::warn!(%seq, "Could not mark journal entry aborted: {err}");
            self.pending_abort = Some(seq);
        }
    }

    fn settle_pending_abort(&mut self) -> Result<(), StoreError> {
        let Some(seq) = self.pending_abort else {
            return Ok(());
        };
        match self.store.journal().resolve(seq, JournalResolution::Aborted) {
            Ok(()) | Err(StoreError::UnknownJournalEntry(_)) => {
                self.pending_abort = None;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn reject(
        &mut self,
        request: &NavigationRequest,
        reason: RejectionReason,
        now: DateTime<Utc>,
    ) -> NavigationOutcome {
        let current = &self.state.state;
        let requested_route = RouteId::new(sanitize_field(
            request.target.as_str(),
            FieldShape::SingleLine,
            MAX_LOGGED_ROUTE_CHARS,
        ));
        tracing::info!(
            code = reason.code(),
            mode = %current.mode,
            route = %requested_route,
            event = %request.event,
            "Navigation rejected"
        );

        let record = Record::Rejection(NewRejection {
            mode: current.mode,
            current_route: current.route.clone(),
            requested_route,
            event: request.event,
            reason: reason.clone(),
            recorded_at: now,
        });
        let store = &mut self.store;
        if let Err(err) = self
            .retry
            .run(|| store.write(std::slice::from_ref(&record)))
        {
            tracing::warn!(code = reason.code(), "Failed to log rejection: {err}");
        }

        NavigationOutcome::Rejected(reason)
    }
}
