//! Exponential backoff for retrying transient transport failures.

use rand::Rng;
use std::time::Duration;

/// Parameters of an exponential backoff with downward jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
        }
    }
}

impl Backoff {
    /// How long to wait before retry number `retry` (the first attempt is `0`).
    ///
    /// The first attempt never waits. Later attempts wait
    /// `base_delay * factor^retry`, reduced by up to 50% of jitter and capped
    /// at `max_delay`.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let backoff = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let jittered = backoff - backoff * 0.5 * rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}
