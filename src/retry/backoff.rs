use rand::Rng;
use std::time::Duration;

/// Caps the doubling so very large attempt counts cannot overflow.
const MAX_EXPONENT: u32 = 20;

/// Exponential backoff with uniform additive jitter:
/// `base * 2^attempt + U[0, jitter_ceiling)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub jitter_ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            jitter_ceiling: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows a failure at `attempt_count`.
    ///
    /// Jitter is drawn fresh on every call so items that failed together
    /// do not come due together.
    pub fn delay(&self, attempt_count: u32) -> Duration {
        let exponential =
            self.base.as_secs_f64() * 2f64.powi(attempt_count.min(MAX_EXPONENT) as i32);

        let ceiling = self.jitter_ceiling.as_secs_f64();
        let jitter = if ceiling > 0.0 {
            rand::thread_rng().gen_range(0.0..ceiling)
        } else {
            0.0
        };

        Duration::from_secs_f64(exponential + jitter)
    }
}

/// [`BackoffPolicy::delay`] with the default 60s base and 10s jitter ceiling.
pub fn compute_backoff(attempt_count: u32) -> Duration {
    BackoffPolicy::default().delay(attempt_count)
}
