//! Jittered exponential backoff for the agent's reconnect loops
//!
//! Both agent loops (the stream dispatcher and the call-session loop) share one
//! shape: try to reach the gateway, and on failure sleep for a growing, jittered
//! delay unless shutdown arrives first. [`Backoff`] owns that delay and the
//! attempt budget so the loops only decide *when* to back off.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Ceiling for the growing delay
    pub max_backoff: Duration,
    /// Growth factor applied after every retry
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it (0.0 disables)
    pub jitter: f64,
    /// Consecutive failed attempts tolerated before giving up (None = forever)
    pub max_attempts: Option<usize>,
    /// A session that stayed up at least this long counts as a success
    pub stable_after: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
            stable_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("gave up after {0} consecutive failed attempts")]
    MaxAttemptsReached(usize),
}

/// Backoff state of one reconnecting loop
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    delay: Duration,
    failures: usize,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            delay: config.initial_backoff,
            config,
            failures: 0,
        }
    }

    /// Record a failure and sleep out its delay
    ///
    /// Returns `Ok(false)` when `cancel` fired during the sleep, so callers can
    /// write `if !backoff.wait(&cancel).await? { break }`.
    ///
    /// # Errors
    /// `MaxAttemptsReached` once more consecutive failures than
    /// `max_attempts` have been recorded
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<bool, ReconnectError> {
        self.failures += 1;
        if let Some(limit) = self.config.max_attempts {
            if self.failures > limit {
                return Err(ReconnectError::MaxAttemptsReached(limit));
            }
        }

        let delay = self.jittered();
        debug!(
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "Backing off before reconnecting"
        );
        self.delay = self
            .delay
            .mul_f64(self.config.multiplier.max(1.0))
            .min(self.config.max_backoff);

        tokio::select! {
            _ = cancel.cancelled() => Ok(false),
            _ = tokio::time::sleep(delay) => Ok(true),
        }
    }

    /// The gateway was reached; the next failure starts from the initial delay
    pub fn succeeded(&mut self) {
        if self.failures > 0 {
            debug!(failures = self.failures, "Reconnected, backoff cleared");
        }
        self.delay = self.config.initial_backoff;
        self.failures = 0;
    }

    /// A session that had been up for `lasted` went away
    ///
    /// Only a stable session clears the backoff. One that drops right after the
    /// handshake keeps growing the delay, so a gateway that accepts and then
    /// immediately kicks the agent is not hammered.
    pub fn session_lost(&mut self, lasted: Duration) {
        if lasted >= self.config.stable_after {
            self.succeeded();
        }
    }

    /// Consecutive failures recorded since the last success
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Base delay of the next `wait`, before jitter
    pub fn delay(&self) -> Duration {
        self.delay
    }

    fn jittered(&self) -> Duration {
        let spread = self.config.jitter.clamp(0.0, 1.0);
        if spread == 0.0 {
            return self.delay;
        }
        self.delay.mul_f64(rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread))
    }
}
