//! Rate limiting primitives.
//!
//! This module provides the building blocks for admission control:
//! - [`RateLimiter`]: The core trait every decision stage implements.
//! - [`Decision`]: The result of an admission check (admit/reject).
//! - [`TokenBucket`] and [`BucketRegistry`]: per-client limiting.
//! - [`FixedWindowLimiter`]: a coarse process-wide gate with bounded queuing.
//! - [`AdmissionChain`]: ordered composition of stages behind one `admit` call.
//! - [`AdmissionLayer`]: Tower middleware that enforces the decision on HTTP requests.
//!
//! # Architecture
//!
//! - **Middleware**: `AdmissionLayer` wraps your service. It doesn't know *how* limiting works,
//!   only that it should ask a `RateLimiter` and answer 429 on rejection.
//! - **Logic**: `TokenBucket` and `FixedWindowLimiter` handle the math.
//! - **State**: `BucketRegistry` owns per-client buckets in a sharded concurrent map; there is no
//!   lock shared between unrelated clients.

use std::time::Duration;
use std::{fmt, sync::Arc};

use crate::key::ClientKey;

pub mod bucket;
pub mod chain;
pub mod fixed_window;
pub mod middleware;
pub mod registry;

pub use bucket::TokenBucket;
pub use chain::AdmissionChain;
pub use fixed_window::FixedWindowLimiter;
pub use middleware::{
    check_request, rejection_response, AdmissionLayer, AdmissionService, REJECTION_MESSAGE,
};
pub use registry::{BucketRegistry, PerClientLimiter};

/// Which gate rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectCause {
    /// The client's own token bucket is empty.
    ClientExhausted,
    /// The process-wide fixed window is full (and the queue could not help).
    GlobalOverload,
}

impl RejectCause {
    /// Stable label for logs, metrics and response bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCause::ClientExhausted => "client_exhausted",
            RejectCause::GlobalOverload => "global_overload",
        }
    }
}

impl fmt::Display for RejectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details of a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    /// Which gate rejected.
    pub cause: RejectCause,
    /// How long until admission is likely again. Used for `Retry-After`.
    pub retry_after: Duration,
}

impl Rejection {
    pub fn new(cause: RejectCause, retry_after: Duration) -> Self {
        Self { cause, retry_after }
    }

    /// `retry_after` rounded up to whole seconds, never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        let rounded =
            if self.retry_after.subsec_nanos() > 0 { secs.saturating_add(1) } else { secs };
        rounded.max(1)
    }
}

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Admit {
        /// Whole permits left after this admission.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u32,
    },
    /// The request is rejected.
    Reject(Rejection),
}

impl Decision {
    /// Helper to check if admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit { .. })
    }

    /// The rejection, if any.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Decision::Reject(r) => Some(r),
            Decision::Admit { .. } => None,
        }
    }
}

/// Core interface for an admission stage.
///
/// Decisions are infallible: rejection is a normal outcome, not an error. Implementations must be
/// safe to call concurrently from many request tasks.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether one request from `key` may proceed, spending one permit if so.
    async fn acquire(&self, key: &ClientKey) -> Decision;
}

#[async_trait::async_trait]
impl<L> RateLimiter for Arc<L>
where
    L: RateLimiter + ?Sized,
{
    async fn acquire(&self, key: &ClientKey) -> Decision {
        (**self).acquire(key).await
    }
}
