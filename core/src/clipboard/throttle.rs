//! Token bucket used to throttle clipboard polling (`spec.md` §4.5/§5).

use std::time::Instant;

pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Attempt to take `n` tokens; returns `false` (no tokens consumed) if
    /// unavailable.
    pub fn try_take(&mut self, n: u32) -> bool {
        self.refill();
        let n = n as f64;
        if self.tokens >= n {
            self.tokens -= n;
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
    fn allows_burst_up_to_capacity() {
        let mut bucket = TokenBucket::new(5, 1);
        for _ in 0..5 {
            assert!(bucket.try_take(1));
        }
        assert!(!bucket.try_take(1));
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::new(1, 1000);
        assert!(bucket.try_take(1));
        assert!(!bucket.try_take(1));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(bucket.try_take(1));
    }
}
