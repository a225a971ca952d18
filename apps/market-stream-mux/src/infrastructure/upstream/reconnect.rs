//! Reconnection Backoff
//!
//! Capped exponential backoff with symmetric jitter for upstream links.
//! Delay for attempt `n` (zero-based) is `initial * multiplier^n`, jittered
//! by up to `±jitter_factor`, then capped at `max_delay`.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::LinkSettings;

/// Default jitter fraction.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound on any delay, jitter included.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.2 = ±20%).
    pub jitter_factor: f64,
    /// Attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from(&LinkSettings::default())
    }
}

impl From<&LinkSettings> for BackoffConfig {
    fn from(settings: &LinkSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}

/// Attempt counter producing reconnect delays.
///
/// # Example
///
/// ```rust
/// use market_stream_mux::infrastructure::upstream::reconnect::{Backoff, BackoffConfig};
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(BackoffConfig {
///     jitter_factor: 0.0,
///     ..BackoffConfig::default()
/// });
///
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1000)));
///
/// // Link came back
/// backoff.reset();
/// assert_eq!(backoff.attempt(), 0);
/// ```
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff at attempt zero.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        self.attempt = self.attempt.saturating_add(1);

        let max_ms = duration_ms(self.config.max_delay);
        let base_ms =
            (duration_ms(self.config.initial_delay) * self.config.multiplier.powi(exponent)).min(max_ms);

        let jitter = self.config.jitter_factor.clamp(0.0, 1.0) * base_ms;
        let offset = if jitter > 0.0 {
            rand::rng().random_range(-jitter..=jitter)
        } else {
            0.0
        };

        let delay_ms = (base_ms + offset).clamp(1.0, max_ms.max(1.0));
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(Duration::from_millis(delay_ms.round() as u64))
    }

    /// Forget past failures after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the attempt budget is spent.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.attempt >= self.config.max_attempts
    }
}

#[allow(clippy::cast_precision_loss)]
fn duration_ms(duration: Duration) -> f64 {
    duration.as_millis() as f64
}
