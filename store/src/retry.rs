//! Bounded retry for writes that hit a locked database.
//!
//! The busy handler already waits up to `busy_timeout` per attempt; this adds
//! a small, capped number of re-attempts with exponential backoff and
//! down-jitter. Nothing here ever waits without bound.

use std::time::Duration;

use haven_config::StoreSettings;

use crate::StoreError;

const MAX_DELAY: Duration = Duration::from_secs(1);
const JITTER_FACTOR: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteRetry {
    /// Re-attempts after the first try.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Down-jitter: the delay is scaled by a factor in `[1 - jitter_factor, 1.0]`.
    pub jitter_factor: f64,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self::from_settings(&StoreSettings::default())
    }
}

impl WriteRetry {
    #[must_use]
    pub fn from_settings(settings: &StoreSettings) -> Self {
        Self {
            max_retries: settings.write_retry_attempts,
            initial_delay: settings.write_retry_initial,
            max_delay: MAX_DELAY,
            jitter_factor: JITTER_FACTOR,
        }
    }

    /// Delay before re-attempt number `backoff_step` (0-based).
    #[must_use]
    pub fn delay(&self, backoff_step: u32) -> Duration {
        let exponent = i32::try_from(backoff_step).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = 1.0 - rand::random::<f64>() * self.jitter_factor;
        Duration::from_secs_f64(capped * jitter)
    }

    /// Run `op`, re-running it only on [`StoreError::WriteTimeout`].
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut backoff_step = 0;
        loop {
            match op() {
                Err(err) if err.is_retryable() && backoff_step < self.max_retries => {
                    let delay = self.delay(backoff_step);
                    tracing::debug!(
                        retry = backoff_step + 1,
                        delay_ms = delay.as_millis(),
                        "Database busy; retrying write"
                    );
                    std::thread::sleep(delay);
                    backoff_step += 1;
                }
                other => return other,
            }
        }
    }
}
