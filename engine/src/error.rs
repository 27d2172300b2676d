use std::path::PathBuf;

use haven_store::StoreError;
use thiserror::Error;

/// What the rendering layer can offer when the engine cannot start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Open a fresh store in IDLE. The unreadable file stays quarantined.
    StartFresh,
}

impl RecoveryAction {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            RecoveryAction::StartFresh => "start_fresh",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The store failed its integrity scan and nothing could be salvaged.
    #[error("stored state is unreadable and nothing could be salvaged")]
    CorruptionUnrecoverable { quarantined: PathBuf },
}

impl EngineError {
    /// Calm, non-technical text for the rendering layer.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            EngineError::CorruptionUnrecoverable { .. } => {
                "We couldn't read your saved progress. You can start fresh; nothing you do next depends on it."
            }
            EngineError::Store(err) if err.is_retryable() => {
                "Haven is busy saving. Please try again in a moment."
            }
            EngineError::Store(_) => "Something didn't save. Please try again in a moment.",
        }
    }

    #[must_use]
    pub fn recovery_action(&self) -> Option<RecoveryAction> {
        match self {
            EngineError::CorruptionUnrecoverable { .. } => Some(RecoveryAction::StartFresh),
            EngineError::Store(_) => None,
        }
    }
}

/// Failures talking to a [`NavigationService`](crate::NavigationService).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The worker thread is gone; no further requests can be served.
    #[error("navigation service has stopped")]
    Closed,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_corruption_offers_start_fresh() {
        let err = EngineError::CorruptionUnrecoverable {
            quarantined: PathBuf::from("/tmp/haven.db.corrupt-x"),
        };
        assert_eq!(err.recovery_action(), Some(RecoveryAction::StartFresh));
        assert_eq!(RecoveryAction::StartFresh.label(), "start_fresh");
        assert!(!err.user_message().is_empty());
    }

    #[test]
    fn store_errors_have_no_recovery_action() {
        let err = EngineError::from(StoreError::WriteTimeout);
        assert!(err.recovery_action().is_none());
        assert!(err.user_message().contains("busy"));
    }
}
