use haven_store::StoreError;
use thiserror::Error;

/// Why a sync attempt failed.
///
/// Never fatal. The scheduler logs it and tries again on the next tick.
#[derive(Debug, Error)]
pub enum SyncFailure {
    #[error("content source unreachable after {attempts} attempt(s): {source}")]
    Network {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("content source answered HTTP {status}")]
    HttpStatus { status: u16 },
    #[error("content payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("content payload is malformed: {0}")]
    Payload(String),
    #[error("content cache write failed: {0}")]
    Store(#[from] StoreError),
    /// The cache writer stopped before reporting back.
    #[error("content cache writer was interrupted")]
    Interrupted,
}

impl SyncFailure {
    /// Stable code for logs and the published status.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            SyncFailure::Network { .. } => "network",
            SyncFailure::HttpStatus { .. } => "http_status",
            SyncFailure::PayloadTooLarge { .. } => "payload_too_large",
            SyncFailure::Payload(_) => "payload",
            SyncFailure::Store(_) => "store",
            SyncFailure::Interrupted => "interrupted",
        }
    }
}

/// A sync that did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    Disabled,
}

impl SkipReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SkipReason::Offline => "offline",
            SkipReason::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The configured content endpoint cannot be used.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no sync endpoint is configured")]
    MissingEndpoint,
    #[error("sync endpoint is not a valid URL: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("sync endpoint must use https (got '{scheme}')")]
    InsecureEndpoint { scheme: String },
    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}
