//! Exponential retry delays with an upper bound.
use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

/// Configuration for a [`BackoffTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay returned by the first call to [`BackoffTimer::next`].
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_BASE`].
    pub base: Duration,
    /// Upper bound for any returned delay.
    ///
    /// Defaults to [`BackoffConfig::DEFAULT_CAP`].
    pub cap: Duration,
}

impl BackoffConfig {
    /// Default value for [`BackoffConfig::base`].
    pub const DEFAULT_BASE: Duration = Duration::from_secs(1);
    /// Default value for [`BackoffConfig::cap`].
    pub const DEFAULT_CAP: Duration = Duration::from_secs(30 * 60);

    /// Create a new `BackoffConfig` using default configuration.
    pub fn new() -> BackoffConfig {
        BackoffConfig::default()
    }

    /// Update the base delay with `base`.
    pub fn with_base(mut self, base: Duration) -> BackoffConfig {
        self.base = base;
        self
    }

    /// Update the maximum delay with `cap`.
    pub fn with_cap(mut self, cap: Duration) -> BackoffConfig {
        self.cap = cap;
        self
    }

    /// Delay before retry number `attempt`, counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for BackoffConfig {
    fn default() -> BackoffConfig {
        BackoffConfig {
            base: BackoffConfig::DEFAULT_BASE,
            cap: BackoffConfig::DEFAULT_CAP,
        }
    }
}

/// Generates `base * 2^attempt` delays clamped to `cap`.
///
/// The sequence is deterministic and non-decreasing until [`BackoffTimer::reset`] is called. The
/// timer is `Sync`, so the same instance may be shared between the connection control loop and
/// lifecycle callbacks.
#[derive(Debug)]
pub struct BackoffTimer {
    config: BackoffConfig,
    attempt: AtomicU32,
}

impl BackoffTimer {
    /// Create a timer positioned at the start of its sequence.
    pub fn new(config: BackoffConfig) -> BackoffTimer {
        BackoffTimer {
            config,
            attempt: AtomicU32::new(0),
        }
    }

    /// Return the next delay and advance the sequence.
    pub fn next(&self) -> Duration {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
        self.config.delay(attempt)
    }

    /// Restart the sequence at `base`.
    pub fn reset(&self) {
        self.attempt.store(0, Ordering::SeqCst);
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }
}
