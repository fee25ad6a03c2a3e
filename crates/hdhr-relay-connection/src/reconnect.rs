//! Delay schedule between tunnel connection attempts
//!
//! The dialer never gives up on a reachable peer; it only spaces out its
//! attempts. Delays grow geometrically from `initial_backoff` and stay at
//! `max_backoff` once they reach it.

use std::time::Duration;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on the delay between retries
    pub max_backoff: Duration,
    /// Growth factor applied after every retry
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(3),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Retry delays for one dialer
///
/// The first delay after [`Backoff::reset`] is always `initial_backoff`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    upcoming: Duration,
    retries: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            upcoming: config.initial_backoff,
            retries: 0,
            config,
        }
    }

    /// Delay the next call to [`Backoff::next_delay`] will hand out
    pub fn peek(&self) -> Duration {
        self.upcoming
    }

    /// Consume one retry and return how long to sleep before it
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.upcoming;
        self.retries = self.retries.saturating_add(1);

        // mul_f64 panics on overflow, so grow in f64 and clamp first
        let grown = delay.as_secs_f64() * self.config.multiplier.max(1.0);
        self.upcoming = if grown >= self.config.max_backoff.as_secs_f64() {
            self.config.max_backoff
        } else {
            Duration::from_secs_f64(grown)
        };

        delay
    }

    /// Retries handed out since the last reset
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.upcoming = self.config.initial_backoff;
        self.retries = 0;
    }
}
