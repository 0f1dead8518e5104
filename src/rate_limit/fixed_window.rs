//! Process-wide fixed-window limiter with bounded queuing.

use crate::clock::{Clock, MonotonicClock};
use crate::key::ClientKey;
use crate::rate_limit::{Decision, RateLimiter, RejectCause, Rejection};
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug)]
struct WindowState {
    window_start_millis: u64,
    count: u32,
}

enum Attempt {
    Admitted { remaining: u32 },
    Full { until_next: Duration },
}

/// Global counter admitting at most `permit_limit` requests per `window`.
///
/// The window opens on the first request after the previous one has elapsed
/// (`window_start = now`), not on a wall-clock grid. `(window_start, count)` change together
/// under one mutex, so a reset is never observed half-done.
///
/// When the window is full, up to `queue_limit` callers may wait for the boundary and then try
/// once more. Waiting is bounded: if the boundary is further away than `queue_timeout` the caller
/// is rejected immediately. A waiting future that is dropped gives its queue slot back.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    permit_limit: u32,
    window: Duration,
    queue_limit: usize,
    queue_timeout: Duration,
    state: Mutex<WindowState>,
    queue: Semaphore,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl FixedWindowLimiter {
    /// Limiter without queuing.
    pub fn new(permit_limit: u32, window: Duration) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let now = clock.now_millis();
        Self {
            permit_limit,
            window,
            queue_limit: 0,
            queue_timeout: window,
            state: Mutex::new(WindowState {
                window_start_millis: now,
                count: 0,
            }),
            queue: Semaphore::new(0),
            clock,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Let up to `limit` callers wait for the next window, each for at most `timeout`.
    ///
    /// `limit` is capped at [`Semaphore::MAX_PERMITS`].
    pub fn with_queue(mut self, limit: usize, timeout: Duration) -> Self {
        let limit = limit.min(Semaphore::MAX_PERMITS);
        self.queue_limit = limit;
        self.queue_timeout = timeout;
        self.queue = Semaphore::new(limit);
        self
    }

    /// Override the clock (useful for deterministic tests). Restarts the current window.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        let now = clock.now_millis();
        self.clock = Arc::new(clock);
        self.state = Mutex::new(WindowState {
            window_start_millis: now,
            count: 0,
        });
        self
    }

    /// Override how queued callers wait.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn permit_limit(&self) -> u32 {
        self.permit_limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn queue_limit(&self) -> usize {
        self.queue_limit
    }

    /// Callers currently waiting for the next window.
    pub fn queued(&self) -> usize {
        self.queue_limit.saturating_sub(self.queue.available_permits())
    }

    /// Admissions counted in the current window.
    pub fn count(&self) -> u32 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).count
    }

    /// Admit if the current window has room. Never waits.
    pub fn try_consume_now(&self) -> bool {
        matches!(self.attempt(), Attempt::Admitted { .. })
    }

    /// Admit, queue for the next window, or reject.
    pub async fn try_consume(&self) -> Decision {
        let until_next = match self.attempt() {
            Attempt::Admitted { remaining } => return Decision::Admit { remaining },
            Attempt::Full { until_next } => until_next,
        };

        if until_next > self.queue_timeout {
            return self.reject(until_next, "window boundary beyond queue timeout");
        }
        let Ok(_slot) = self.queue.try_acquire() else {
            return self.reject(until_next, "queue full");
        };

        debug!(wait_ms = until_next.as_millis() as u64, "queued for next rate limit window");
        self.sleeper.sleep(until_next).await;

        match self.attempt() {
            Attempt::Admitted { remaining } => Decision::Admit { remaining },
            Attempt::Full { until_next } => self.reject(until_next, "still full after queuing"),
        }
    }

    fn attempt(&self) -> Attempt {
        let window_millis = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now_millis();

        if now.saturating_sub(state.window_start_millis) >= window_millis {
            state.window_start_millis = now;
            state.count = 0;
        }

        if state.count < self.permit_limit {
            state.count += 1;
            Attempt::Admitted {
                remaining: self.permit_limit - state.count,
            }
        } else {
            let boundary = state.window_start_millis.saturating_add(window_millis);
            Attempt::Full {
                until_next: Duration::from_millis(boundary.saturating_sub(now)),
            }
        }
    }

    fn reject(&self, until_next: Duration, detail: &'static str) -> Decision {
        warn!(
            cause = %RejectCause::GlobalOverload,
            permit_limit = self.permit_limit,
            retry_after_secs = until_next.as_secs(),
            detail,
            "global rate limit exceeded"
        );
        Decision::Reject(Rejection::new(RejectCause::GlobalOverload, until_next))
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn acquire(&self, _key: &ClientKey) -> Decision {
        self.try_consume().await
    }
}
