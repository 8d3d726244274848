//! Token bucket rate limiter.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Token bucket that refills lazily on each acquisition attempt.
///
/// Tokens refill at `refill_rate` per second up to `capacity`. The bucket
/// starts full. Acquisition never blocks; callers decide whether to retry or
/// reject.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::starting_at(capacity, refill_rate, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    pub fn starting_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_rate: refill_rate.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Take `n` tokens if available.
    pub fn try_acquire(&self, n: u32) -> bool {
        self.try_acquire_at(n, Instant::now())
    }

    /// Take `n` tokens if available, refilling up to `now` first.
    ///
    /// On failure the token count is left exactly as refilled.
    pub fn try_acquire_at(&self, n: u32, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state, now);
        let n = f64::from(n);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Return `n` tokens taken by a request that was later turned away.
    ///
    /// Never raises the count above capacity.
    pub fn refund(&self, n: u32) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tokens = (state.tokens + f64::from(n)).min(self.capacity);
    }

    /// Tokens available as of `now`.
    pub fn available_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state, now);
        state.tokens
    }

    pub fn available(&self) -> f64 {
        self.available_at(Instant::now())
    }

    /// Whether the bucket has refilled to capacity as of `now`.
    pub fn is_full_at(&self, now: Instant) -> bool {
        self.available_at(now) >= self.capacity
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // Instants earlier than the last refill add nothing.
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn refund_restores_up_to_capacity() {
        let now = Instant::now();
        let bucket = TokenBucket::starting_at(2, 0.0, now);
        assert!(bucket.try_acquire_at(2, now));
        bucket.refund(1);
        assert_eq!(bucket.available_at(now), 1.0);
        bucket.refund(5);
        assert_eq!(bucket.available_at(now), 2.0);
    }

    #[test]
    fn starts_full() {
        let now = Instant::now();
        let bucket = TokenBucket::starting_at(5, 1.0, now);
        assert_eq!(bucket.available_at(now), 5.0);
    }

    #[test]
    fn drains_then_rejects() {
        let now = Instant::now();
        let bucket = TokenBucket::starting_at(3, 1.0, now);
        assert!(bucket.try_acquire_at(1, now));
        assert!(bucket.try_acquire_at(2, now));
        assert!(!bucket.try_acquire_at(1, now));
    }

    #[test]
    fn failed_acquire_has_no_side_effects() {
        let now = Instant::now();
        let bucket = TokenBucket::starting_at(4, 0.0, now);
        assert!(bucket.try_acquire_at(3, now));
        assert!(!bucket.try_acquire_at(2, now));
        assert_eq!(bucket.available_at(now), 1.0);
        assert!(bucket.try_acquire_at(1, now));
    }

    #[test]
    fn refills_with_elapsed_time() {
        let start = Instant::now();
        let bucket = TokenBucket::starting_at(10, 2.0, start);
        assert!(bucket.try_acquire_at(10, start));
        assert!(!bucket.try_acquire_at(1, start));

        let later = start + Duration::from_millis(1500);
        // 1.5s * 2/s = 3 tokens
        assert!(bucket.try_acquire_at(3, later));
        assert!(!bucket.try_acquire_at(1, later));
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let start = Instant::now();
        let bucket = TokenBucket::starting_at(4, 100.0, start);
        assert!(bucket.try_acquire_at(4, start));
        let later = start + Duration::from_secs(60);
        assert_eq!(bucket.available_at(later), 4.0);
        assert!(bucket.is_full_at(later));
    }

    #[test]
    fn request_larger_than_capacity_never_succeeds() {
        let start = Instant::now();
        let bucket = TokenBucket::starting_at(2, 10.0, start);
        assert!(!bucket.try_acquire_at(3, start + Duration::from_secs(100)));
        assert_eq!(bucket.available_at(start + Duration::from_secs(100)), 2.0);
    }

    #[test]
    fn clock_going_backwards_adds_nothing() {
        let start = Instant::now() + Duration::from_secs(10);
        let bucket = TokenBucket::starting_at(2, 1.0, start);
        assert!(bucket.try_acquire_at(2, start));
        assert!(!bucket.try_acquire_at(1, start - Duration::from_secs(5)));
    }

    #[test]
    fn negative_refill_rate_is_clamped() {
        let bucket = TokenBucket::new(1, -3.0);
        assert_eq!(bucket.refill_rate(), 0.0);
        assert_eq!(bucket.capacity(), 1.0);
    }

    #[test]
    fn cumulative_consumption_bounded_by_refill() {
        let start = Instant::now();
        let bucket = TokenBucket::starting_at(5, 10.0, start);
        let mut granted = 0u32;
        for step in 0..1000u64 {
            let now = start + Duration::from_millis(step);
            if bucket.try_acquire_at(1, now) {
                granted += 1;
            }
        }
        // 5 initial + 0.999s * 10/s
        let bound = 5.0 + 0.999 * 10.0;
        assert!(f64::from(granted) <= bound + 1e-9, "granted {granted}");
    }
}
