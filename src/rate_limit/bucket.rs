use crate::clock::{Clock, MonotonicClock};
use crate::rate_limit::{Decision, RejectCause, Rejection};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill_millis: u64,
}

/// A Token Bucket rate limiter.
///
/// Replenishes tokens continuously at `refill_rate` per second, up to `capacity`. Starts full.
/// Each admitted request spends exactly one token.
///
/// The refill-then-consume step runs under a per-bucket mutex with the clock read inside the
/// critical section, so two concurrent requests never both spend the same token and one client's
/// decisions are evaluated in time order. Buckets share no lock with each other.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket holding `capacity` tokens, refilled at `refill_rate` tokens/sec.
    pub fn new(capacity: u32, refill_rate: f64, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill_millis: now,
            }),
            clock,
        }
    }

    /// Bucket refilled from a requests-per-minute budget, on the monotonic clock.
    pub fn per_minute(requests_per_minute: u32, burst_size: u32) -> Self {
        Self::new(
            burst_size,
            f64::from(requests_per_minute) / 60.0,
            Arc::new(MonotonicClock::default()),
        )
    }

    /// Spend one token if available.
    pub fn try_consume(&self) -> bool {
        self.try_acquire().is_admitted()
    }

    /// Spend one token if available, reporting what is left or how long to wait.
    pub fn try_acquire(&self) -> Decision {
        let mut state = self.lock();
        let now = self.clock.now_millis();
        self.step(&mut state, now)
    }

    /// Same as [`try_acquire`](Self::try_acquire) with an explicit timestamp.
    ///
    /// Replaying the same `(now, try_acquire_at)` sequence against a fresh bucket yields the same
    /// outcomes.
    pub fn try_acquire_at(&self, now_millis: u64) -> Decision {
        let mut state = self.lock();
        self.step(&mut state, now_millis)
    }

    /// Maximum burst.
    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Stored token count as of the last consume (no refill applied).
    pub fn tokens(&self) -> f64 {
        self.lock().tokens
    }

    /// Tokens that would be available at `now_millis`, without mutating the bucket.
    pub fn available_at(&self, now_millis: u64) -> f64 {
        let state = *self.lock();
        self.refilled(state, now_millis).tokens
    }

    /// Milliseconds since the bucket last saw a request.
    pub(crate) fn idle_millis(&self, now_millis: u64) -> u64 {
        now_millis.saturating_sub(self.lock().last_refill_millis)
    }

    /// Whether the bucket would be back at full capacity at `now_millis`.
    pub(crate) fn is_full_at(&self, now_millis: u64) -> bool {
        self.available_at(now_millis) >= self.capacity
    }

    fn step(&self, state: &mut BucketState, now_millis: u64) -> Decision {
        *state = self.refilled(*state, now_millis);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Decision::Admit {
                remaining: state.tokens as u32,
            }
        } else {
            let missing = 1.0 - state.tokens;
            let wait = Duration::try_from_secs_f64(missing / self.refill_rate)
                .unwrap_or(Duration::MAX);
            Decision::Reject(Rejection::new(RejectCause::ClientExhausted, wait))
        }
    }

    fn refilled(&self, state: BucketState, now_millis: u64) -> BucketState {
        // A clock that went backward refills nothing and keeps the later timestamp, so the same
        // interval is never credited twice.
        if now_millis <= state.last_refill_millis {
            return state;
        }
        let elapsed_secs = (now_millis - state.last_refill_millis) as f64 / 1_000.0;
        BucketState {
            tokens: (state.tokens + elapsed_secs * self.refill_rate).min(self.capacity),
            last_refill_millis: now_millis,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // BucketState is always valid, so poisoning is ignored.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
