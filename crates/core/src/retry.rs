//! Retry backoff policy for failed task executions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Exponential backoff with a cap and optional jitter.
///
/// The delay for the n-th retry is
/// `base_interval * multiplier^n`, capped at `max_interval`, then spread by
/// `±jitter` to keep synchronized failures from thundering back in.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Relative jitter in `[0.0, 1.0)`; 0.1 means ±10%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(2),
            multiplier: 2.0,
            max_interval: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that would bring the envelope to
    /// `retry_count` attempts already made.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let raw = self.base_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_interval.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(-self.jitter..self.jitter);
            capped * (1.0 + factor)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Eta for the next generation of a failed envelope.
    pub fn next_eta(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for(retry_count);
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0))
    }
}
