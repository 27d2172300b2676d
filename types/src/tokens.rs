//! Proof tokens attached to navigation requests.
//!
//! Holding a token means a user-attributable action produced it. The engine
//! records every token it acts on in the journal, so a transition into or out
//! of a containment mode can always be traced back to the action that caused it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_TOKEN_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token must not be empty")]
    Empty,
    #[error("token exceeds {MAX_TOKEN_LEN} bytes")]
    TooLong,
    #[error("token contains control characters")]
    ControlCharacters,
}

fn validate(raw: &str) -> Result<(), TokenError> {
    if raw.trim().is_empty() {
        return Err(TokenError::Empty);
    }
    if raw.len() > MAX_TOKEN_LEN {
        return Err(TokenError::TooLong);
    }
    if raw.chars().any(char::is_control) {
        return Err(TokenError::ControlCharacters);
    }
    Ok(())
}

/// An explicit, user-attributable trigger (tap, voice command, hardware
/// button) that may move the user into or out of a containment mode.
///
/// Timers and background signals have no way to mint one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TriggerToken(String);

impl TriggerToken {
    pub fn new(raw: impl Into<String>) -> Result<Self, TokenError> {
        let raw = raw.into();
        validate(&raw)?;
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TriggerToken {
    type Error = TokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TriggerToken> for String {
    fn from(value: TriggerToken) -> Self {
        value.0
    }
}

impl fmt::Display for TriggerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Proof that the user explicitly confirmed a transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConfirmationToken(String);

impl ConfirmationToken {
    pub fn new(raw: impl Into<String>) -> Result<Self, TokenError> {
        let raw = raw.into();
        validate(&raw)?;
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ConfirmationToken {
    type Error = TokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ConfirmationToken> for String {
    fn from(value: ConfirmationToken) -> Self {
        value.0
    }
}

impl fmt::Display for ConfirmationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
