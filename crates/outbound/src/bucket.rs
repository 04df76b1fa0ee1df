use std::time::{Duration, Instant};

/// Classical token bucket: `capacity` tokens refill evenly over `window`,
/// each send consumes one.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    window: Duration,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// The production shape: N messages per minute.
    pub fn per_minute(messages_per_minute: u32) -> Self {
        Self::with_window(messages_per_minute, Duration::from_secs(60))
    }

    pub fn with_window(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    /// One refill interval: how long a full bucket takes to earn one token.
    pub fn refill_interval(&self) -> Duration {
        self.window / self.capacity.max(1)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = elapsed.as_secs_f64() / self.window.as_secs_f64() * self.capacity as f64;
        self.tokens = (self.tokens + earned).min(self.capacity as f64);
        self.last_refill = now;
    }

    pub fn try_take(&mut self) -> bool {
        self.try_take_at(Instant::now())
    }

    pub fn try_take_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_capacity_then_empty() {
        let mut bucket = TokenBucket::per_minute(20);
        let now = Instant::now();
        for _ in 0..20 {
            assert!(bucket.try_take_at(now));
        }
        // The 21st send in the same window has to wait
        assert!(!bucket.try_take_at(now));
    }

    #[test]
    fn test_one_refill_interval_earns_one_token() {
        let mut bucket = TokenBucket::per_minute(20);
        let interval = bucket.refill_interval();
        assert_eq!(interval, Duration::from_secs(3));

        let now = Instant::now();
        for _ in 0..20 {
            assert!(bucket.try_take_at(now));
        }
        // Just shy of one refill interval: still empty
        assert!(!bucket.try_take_at(now + interval - Duration::from_millis(100)));
        assert!(bucket.try_take_at(now + interval));
        assert!(!bucket.try_take_at(now + interval));
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::with_window(5, Duration::from_secs(1));
        let now = Instant::now();
        // Long idle period refills to capacity, not beyond
        for _ in 0..5 {
            assert!(bucket.try_take_at(now + Duration::from_secs(60)));
        }
        assert!(!bucket.try_take_at(now + Duration::from_secs(60)));
    }
}
