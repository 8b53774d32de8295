//! Token bucket refilled once per fixed window

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Token bucket holding `capacity` tokens per window.
///
/// The whole bucket is refilled when a new window starts, so a burst that
/// exhausts it is rejected for the rest of the window and accepted again in
/// the next one. State is a single atomic word: the window index in the high
/// 32 bits and the tokens used in the low 32 bits.
#[derive(Debug)]
pub struct TokenBucket {
    state: AtomicU64,
    capacity: u32,
    window_ms: u64,
}

impl TokenBucket {
    /// Bucket admitting `capacity` operations per second
    pub fn per_second(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(1))
    }

    pub fn new(capacity: u32, window: Duration) -> Self {
        let window_ms = (window.as_millis() as u64).max(1);
        Self {
            state: AtomicU64::new(pack(window_index(Self::now_millis(), window_ms), 0)),
            capacity,
            window_ms,
        }
    }

    /// Get current time in milliseconds
    pub fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Try to take one token.
    /// On rejection returns the milliseconds left until the next window.
    pub fn try_consume(&self) -> Result<u32, u64> {
        self.try_consume_at(Self::now_millis())
    }

    /// Same as `try_consume`, at an explicit point in time.
    /// Returns the tokens remaining in the current window on success.
    pub fn try_consume_at(&self, now_ms: u64) -> Result<u32, u64> {
        let window = window_index(now_ms, self.window_ms);
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            let (current_window, used) = unpack(current);
            // A caller with an older clock reading counts against the newer window
            let (window, used) = if current_window >= window {
                (current_window, used)
            } else {
                (window, 0)
            };

            if used >= self.capacity {
                let window_end = (window as u64 + 1) * self.window_ms;
                return Err(window_end.saturating_sub(now_ms).max(1));
            }

            match self.state.compare_exchange_weak(
                current,
                pack(window, used + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(self.capacity - used - 1),
                // CAS failed, retry
                Err(actual) => current = actual,
            }
        }
    }

    /// Tokens still available in the window containing `now_ms`
    pub fn available_at(&self, now_ms: u64) -> u32 {
        let (current_window, used) = unpack(self.state.load(Ordering::Acquire));
        if current_window >= window_index(now_ms, self.window_ms) {
            self.capacity.saturating_sub(used)
        } else {
            self.capacity
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Whether the bucket has seen no use since before `now_ms - idle_ms`
    pub fn is_idle(&self, now_ms: u64, idle_ms: u64) -> bool {
        let (current_window, _) = unpack(self.state.load(Ordering::Acquire));
        let threshold = window_index(now_ms.saturating_sub(idle_ms), self.window_ms);
        current_window < threshold
    }
}

fn window_index(now_ms: u64, window_ms: u64) -> u32 {
    // Truncation only wraps after ~136 years of one-second windows
    (now_ms / window_ms) as u32
}

fn pack(window: u32, used: u32) -> u64 {
    ((window as u64) << 32) | used as u64
}

fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn test_token_bucket_basic() {
        let bucket = TokenBucket::new(10, Duration::from_secs(1));

        // Should be able to consume up to capacity
        for i in 0..10 {
            assert_eq!(bucket.try_consume_at(T0 + i), Ok(9 - i as u32));
        }

        // Should be empty for the rest of the window
        assert_eq!(bucket.try_consume_at(T0 + 10), Err(990));
        assert_eq!(bucket.try_consume_at(T0 + 999), Err(1));
        assert_eq!(bucket.available_at(T0 + 500), 0);
    }

    #[test]
    fn test_token_bucket_refills_next_window() {
        let bucket = TokenBucket::new(3, Duration::from_secs(1));
        for _ in 0..3 {
            assert!(bucket.try_consume_at(T0).is_ok());
        }
        assert!(bucket.try_consume_at(T0 + 400).is_err());

        assert_eq!(bucket.available_at(T0 + 1000), 3);
        assert!(bucket.try_consume_at(T0 + 1000).is_ok());
        assert_eq!(bucket.available_at(T0 + 1000), 2);
    }

    #[test]
    fn test_stale_clock_reading_keeps_newer_window() {
        let bucket = TokenBucket::new(2, Duration::from_secs(1));
        assert!(bucket.try_consume_at(T0 + 1000).is_ok());
        assert!(bucket.try_consume_at(T0 + 1001).is_ok());

        // A late caller still holding a reading from the previous window
        assert!(bucket.try_consume_at(T0 + 10).is_err());
        assert_eq!(bucket.available_at(T0 + 10), 0);

        assert!(bucket.try_consume_at(T0 + 1500).is_err());
        assert_eq!(bucket.try_consume_at(T0 + 2000), Ok(1));
    }

    #[test]
    fn test_zero_capacity_rejects() {
        let bucket = TokenBucket::per_second(0);
        assert!(bucket.try_consume().is_err());
    }

    #[test]
    fn test_idle_detection() {
        let bucket = TokenBucket::new(5, Duration::from_secs(1));
        bucket.try_consume_at(T0).unwrap();
        assert!(!bucket.is_idle(T0 + 500, 60_000));
        assert!(bucket.is_idle(T0 + 120_000, 60_000));
    }

    #[test]
    fn test_concurrent_consumers_never_exceed_capacity() {
        use std::sync::atomic::AtomicU32;
        use std::sync::Arc;

        let bucket = Arc::new(TokenBucket::new(100, Duration::from_secs(3600)));
        let accepted = Arc::new(AtomicU32::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                let accepted = accepted.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if bucket.try_consume().is_ok() {
                            accepted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::Relaxed), 100);
    }
}
