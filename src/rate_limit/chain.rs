//! Ordered composition of admission stages.

use crate::key::ClientKey;
use crate::rate_limit::{
    BucketRegistry, Decision, FixedWindowLimiter, PerClientLimiter, RateLimiter,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Runs its stages in order and stops at the first rejection.
///
/// Stages before the rejecting one have already spent their permit; nothing is refunded.
/// With every stage admitting, `remaining` is the smallest value reported by any stage.
#[derive(Clone, Default)]
pub struct AdmissionChain {
    stages: Vec<Arc<dyn RateLimiter>>,
}

impl fmt::Debug for AdmissionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionChain").field("stages", &self.stages.len()).finish()
    }
}

impl AdmissionChain {
    /// Empty chain. Admits everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn stage<L: RateLimiter + 'static>(self, limiter: L) -> Self {
        self.stage_arc(Arc::new(limiter))
    }

    /// Append a shared stage.
    pub fn stage_arc(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.stages.push(limiter);
        self
    }

    /// The standard pipeline: the client's bucket first, then the global window.
    pub fn per_client_then_global(
        registry: Arc<BucketRegistry>,
        window: Arc<FixedWindowLimiter>,
    ) -> Self {
        Self::new().stage(PerClientLimiter::new(registry)).stage_arc(window)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Single merged decision for one request from `key`.
    pub async fn admit(&self, key: &ClientKey) -> Decision {
        let mut remaining = u32::MAX;
        for stage in &self.stages {
            match stage.acquire(key).await {
                Decision::Admit { remaining: left } => remaining = remaining.min(left),
                rejected @ Decision::Reject(_) => return rejected,
            }
        }
        debug!(client = %key, remaining, "request admitted");
        Decision::Admit { remaining }
    }
}

#[async_trait]
impl RateLimiter for AdmissionChain {
    async fn acquire(&self, key: &ClientKey) -> Decision {
        self.admit(key).await
    }
}
