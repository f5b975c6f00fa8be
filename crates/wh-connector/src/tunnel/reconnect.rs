//! Exponential backoff for reconnection

use std::time::Duration;

use rand::Rng;
use wh_core::config::BackoffConfig;

/// Exponential backoff with jitter for reconnection attempts.
///
/// The base delay starts at `initial`, is multiplied after every attempt
/// and is capped at `max`. Each returned delay adds up to `jitter * base`
/// on top of the base.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    /// Base of the next delay
    current: Duration,
    max: Duration,
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial.min(max),
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Base of the next delay, without jitter
    pub fn base(&self) -> Duration {
        self.current
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// Like [`next_delay`](Self::next_delay) with a caller-supplied RNG
    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current;

        let next = base.as_secs_f64() * self.multiplier;
        self.current = if next >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(next).max(base)
        };

        let jitter_amount = base.as_secs_f64() * self.jitter * rng.gen::<f64>();
        base + Duration::from_secs_f64(jitter_amount)
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}
