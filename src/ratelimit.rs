//! Per-error-class log rate limiting.

use core::sync::atomic::{AtomicU32, Ordering};

/**
    occurrence counter deciding whether a recurring error is still worth logging

    The first `threshold` occurrences always log. Past the threshold only every
    `reduced_rate`-th further occurrence logs, so a storm of identical bus errors cannot
    flood the log while still leaving a trace that the condition persists.

    Lock free so it can be driven from the notification callback, which runs on
    stack-internal threads.
*/
#[derive(Debug)]
pub struct RateLimiter {
    threshold: u32,
    reduced_rate: u32,
    occurrences: AtomicU32,
}

impl RateLimiter {
    pub const fn new(threshold: u32, reduced_rate: u32) -> Self {
        Self {
            threshold,
            reduced_rate,
            occurrences: AtomicU32::new(0),
        }
    }

    /// record one occurrence
    pub fn count(&self) {
        self.occurrences.fetch_add(1, Ordering::Relaxed);
    }

    /// true exactly once, when the counter just reached the threshold
    pub fn on_limit(&self) -> bool {
        self.occurrences.load(Ordering::Relaxed) == self.threshold
    }

    /// true if the current occurrence shall be logged
    pub fn should_log(&self) -> bool {
        let n = self.occurrences.load(Ordering::Relaxed);
        n <= self.threshold || (n - self.threshold) % self.reduced_rate == 0
    }

    /// forget every past occurrence, the next ones log at full rate again
    pub fn reset(&self) {
        self.occurrences.store(0, Ordering::Relaxed);
    }

    pub fn occurrences(&self) -> u32 {
        self.occurrences.load(Ordering::Relaxed)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_rate_until_threshold() {
        let limiter = RateLimiter::new(3, 5);
        for _ in 0 .. 3 {
            limiter.count();
            assert!(limiter.should_log());
        }
        assert!(limiter.on_limit());
    }

    #[test]
    fn reduced_rate_past_threshold() {
        let limiter = RateLimiter::new(3, 5);
        for _ in 0 .. 3 {limiter.count();}
        // occurrences 4..7 stay silent, the 8th (threshold + rate) logs again
        for _ in 0 .. 4 {
            limiter.count();
            assert!(! limiter.on_limit());
            assert_eq!(limiter.should_log(), limiter.occurrences() == 8);
        }
        limiter.count();
        assert!(limiter.should_log());
    }

    #[test]
    fn reset_restores_full_rate() {
        let limiter = RateLimiter::new(2, 10);
        for _ in 0 .. 6 {limiter.count();}
        assert!(! limiter.should_log());
        limiter.reset();
        limiter.count();
        assert!(limiter.should_log());
        assert!(! limiter.on_limit());
        limiter.count();
        assert!(limiter.on_limit());
    }
}
