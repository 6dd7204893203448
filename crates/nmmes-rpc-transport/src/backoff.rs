//! Reconnect delay policy

use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Multiplier applied after every attempt
    pub factor: u32,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Attempts before giving up; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            factor: 4,
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl BackoffConfig {
    /// Set the first delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the growth factor
    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor;
        self
    }

    /// Set the delay cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Limit the number of attempts
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// Produces successive reconnect delays
pub trait BackoffStrategy: Send {
    /// Next delay, or `None` once no further attempt should be made
    fn backoff(&mut self) -> Option<Duration>;

    /// Start over after a successful connection
    fn reset(&mut self);

    /// Attempts handed out since the last reset
    fn attempts(&self) -> u32;
}

/// `initial, initial*factor, initial*factor^2, ...` capped at `max_delay`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a backoff in its initial state
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_delay,
            attempts: 0,
            config,
        }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn backoff(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_retries {
            if self.attempts >= max {
                return None;
            }
        }

        let delay = self.current.min(self.config.max_delay);
        let next = self.current
            .checked_mul(self.config.factor)
            .unwrap_or(self.config.max_delay);
        self.current = next.min(self.config.max_delay);
        self.attempts += 1;
        Some(delay)
    }

    fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}
