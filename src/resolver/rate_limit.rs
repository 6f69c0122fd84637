use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Sentinel for "no operation permitted yet".
const NEVER: u64 = u64::MAX;

/// Gate enforcing a minimum spacing between outbound operations.
///
/// Holds the time of the last permitted operation as milliseconds since the
/// limiter was created. Claims go through `compare_exchange`, so one instance
/// can be shared (via `Arc`) by concurrent workers in the same process. It is
/// not shared across processes.
///
/// Time comes from `tokio::time::Instant`, which tests can pause and advance.
#[derive(Debug)]
pub struct RateLimiter {
    spacing: Duration,
    origin: Instant,
    last_permitted_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            origin: Instant::now(),
            last_permitted_ms: AtomicU64::new(NEVER),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Claim a slot at `now` if at least `spacing` has passed since the last
    /// permitted operation.
    ///
    /// Returns `true` and records `now` on success; leaves state untouched
    /// otherwise.
    pub fn try_acquire(&self, now: Instant) -> bool {
        let now_ms = self.millis_since_origin(now);
        let spacing_ms = self.spacing_ms();
        let mut last = self.last_permitted_ms.load(Ordering::Acquire);

        loop {
            if last != NEVER && now_ms < last.saturating_add(spacing_ms) {
                return false;
            }
            match self.last_permitted_ms.compare_exchange_weak(
                last,
                now_ms,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                // Another worker claimed a slot (or a spurious failure); re-check against it
                Err(actual) => last = actual,
            }
        }
    }

    /// Wait until a slot can be claimed, then claim it.
    pub async fn acquire(&self) {
        loop {
            let now = Instant::now();
            if self.try_acquire(now) {
                return;
            }
            // Minimum 1ms sleep prevents spin-waiting on rounding
            let wait = self.time_until_next(now).max(Duration::from_millis(1));
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limiter waiting for slot");
            tokio::time::sleep(wait).await;
        }
    }

    fn time_until_next(&self, now: Instant) -> Duration {
        let last = self.last_permitted_ms.load(Ordering::Acquire);
        if last == NEVER {
            return Duration::ZERO;
        }
        let next_allowed = last.saturating_add(self.spacing_ms());
        Duration::from_millis(next_allowed.saturating_sub(self.millis_since_origin(now)))
    }

    fn millis_since_origin(&self, now: Instant) -> u64 {
        // Clamp below NEVER so a real timestamp can't collide with the sentinel
        let ms = now.saturating_duration_since(self.origin).as_millis();
        u64::try_from(ms).unwrap_or(NEVER - 1).min(NEVER - 1)
    }

    fn spacing_ms(&self) -> u64 {
        u64::try_from(self.spacing.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_succeeds() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        assert!(limiter.try_acquire(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_instant_grants_once() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        let now = Instant::now();
        assert!(limiter.try_acquire(now));
        assert!(!limiter.try_acquire(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_boundary() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        let start = Instant::now();
        assert!(limiter.try_acquire(start));
        assert!(!limiter.try_acquire(start + Duration::from_millis(499)));
        assert!(limiter.try_acquire(start + Duration::from_millis(500)));
        assert!(!limiter.try_acquire(start + Duration::from_millis(900)));
        assert!(limiter.try_acquire(start + Duration::from_millis(1000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_spacing_always_grants() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let now = Instant::now();
        assert!(limiter.try_acquire(now));
        assert!(limiter.try_acquire(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_spacing() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_claims_at_same_instant() {
        let limiter = std::sync::Arc::new(RateLimiter::new(Duration::from_secs(1)));
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.try_acquire(now))
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 1);
    }
}
