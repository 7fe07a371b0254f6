//! A token bucket over byte permits.
//!
//! Permits refill continuously at `permits_per_second` and accumulate up to
//! `permits_per_second * max_burst_seconds`, so an idle service can burst
//! that many bytes at once. Acquisition never blocks.

use logdb_time::{Time, TimeProvider};
use std::sync::Arc;

/// Non-blocking byte-permit bucket for one service.
#[derive(Debug)]
pub struct TokenBucket {
    permits_per_second: f64,
    max_permits: f64,
    stored_permits: f64,
    last_refill: Time,
    time_provider: Arc<dyn TimeProvider>,
}

impl TokenBucket {
    /// Create a bucket refilling at `permits_per_second` and holding at
    /// most `permits_per_second * max_burst_seconds` permits.
    ///
    /// A warm bucket starts full and admits a burst immediately; a cold one
    /// starts empty and earns its first permits over time.
    pub fn new(
        permits_per_second: u64,
        max_burst_seconds: u64,
        initialize_warm: bool,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let permits_per_second = permits_per_second as f64;
        let max_permits = permits_per_second * max_burst_seconds as f64;
        Self {
            permits_per_second,
            max_permits,
            stored_permits: if initialize_warm { max_permits } else { 0.0 },
            last_refill: time_provider.now(),
            time_provider,
        }
    }

    fn refill(&mut self, now: Time) {
        let elapsed = now
            .checked_duration_since(self.last_refill)
            .unwrap_or_default();
        self.stored_permits = self
            .max_permits
            .min(self.stored_permits + elapsed.as_secs_f64() * self.permits_per_second);
        self.last_refill = now;
    }

    /// Take `permits` permits if available. Never blocks.
    pub fn try_acquire(&mut self, permits: u64) -> bool {
        self.refill(self.time_provider.now());

        let permits = permits as f64;
        if permits <= self.stored_permits {
            self.stored_permits -= permits;
            true
        } else {
            false
        }
    }

    /// Currently stored permits, rounded down.
    pub fn stored_permits(&self) -> u64 {
        self.stored_permits as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logdb_time::MockProvider;
    use std::time::Duration;

    fn bucket(
        permits_per_second: u64,
        max_burst_seconds: u64,
        warm: bool,
    ) -> (Arc<MockProvider>, TokenBucket) {
        let time = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let bucket = TokenBucket::new(
            permits_per_second,
            max_burst_seconds,
            warm,
            Arc::clone(&time) as Arc<dyn TimeProvider>,
        );
        (time, bucket)
    }

    #[test]
    fn cold_start_earns_permits_over_time() {
        let (time, mut bucket) = bucket(100, 1, false);

        assert!(!bucket.try_acquire(50));

        time.inc(Duration::from_secs(1));
        assert!(bucket.try_acquire(50));
        assert_eq!(bucket.stored_permits(), 50);
    }

    #[test]
    fn warm_start_admits_full_burst() {
        let (_time, mut bucket) = bucket(1000, 3, true);

        assert!(bucket.try_acquire(3000));
        assert!(!bucket.try_acquire(1));
    }

    #[test]
    fn storage_is_capped_at_burst() {
        let (time, mut bucket) = bucket(100, 2, false);

        // far longer than the burst window
        time.inc(Duration::from_secs(3600));
        assert!(!bucket.try_acquire(201));
        assert!(bucket.try_acquire(200));
    }

    #[test]
    fn refill_is_continuous() {
        let (time, mut bucket) = bucket(100, 1, false);

        time.inc(Duration::from_millis(250));
        assert!(bucket.try_acquire(25));
        assert!(!bucket.try_acquire(1));
    }

    #[test]
    fn zero_rate_never_admits() {
        let (time, mut bucket) = bucket(0, 3, true);

        assert!(!bucket.try_acquire(1));
        time.inc(Duration::from_secs(1000));
        assert!(!bucket.try_acquire(1));
    }

    #[test]
    fn admitted_bytes_are_bounded_over_any_window() {
        let (time, mut bucket) = bucket(100, 2, true);

        // hammer the bucket for 10 simulated seconds
        let mut admitted = 0u64;
        for _ in 0..1000 {
            if bucket.try_acquire(7) {
                admitted += 7;
            }
            time.inc(Duration::from_millis(10));
        }

        // rate * window + rate * burst
        assert!(admitted <= 100 * 10 + 100 * 2);
    }
}
