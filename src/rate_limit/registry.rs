//! Registry of per-client token buckets.

use crate::clock::{Clock, MonotonicClock};
use crate::key::ClientKey;
use crate::rate_limit::{Decision, RateLimiter, TokenBucket};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Concurrent map from client key to that client's [`TokenBucket`].
///
/// Buckets are created lazily, full, on the first request from a key. Creation is a single
/// atomic insert-or-fetch on a sharded map: concurrent first requests from one key all receive
/// the same bucket, and unrelated keys never contend on a common lock.
///
/// Without an idle TTL the registry only grows. With one, [`evict_idle`](Self::evict_idle)
/// drops buckets that have been idle for the TTL *and* have refilled to capacity; such a bucket
/// is indistinguishable from a fresh one, so eviction never changes an admission decision.
#[derive(Debug)]
pub struct BucketRegistry {
    buckets: DashMap<ClientKey, Arc<TokenBucket>>,
    capacity: u32,
    refill_rate: f64,
    idle_ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl BucketRegistry {
    /// Registry whose buckets hold `capacity` tokens and refill at `refill_rate` tokens/sec.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity,
            refill_rate,
            idle_ttl: None,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Registry budgeted in requests per minute.
    pub fn per_minute(requests_per_minute: u32, burst_size: u32) -> Self {
        Self::new(burst_size, f64::from(requests_per_minute) / 60.0)
    }

    /// Override the clock (useful for deterministic tests). Shared by every bucket created later.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Enable idle eviction.
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = Some(ttl);
        self
    }

    /// Fetch the bucket for `key`, creating a full one if the key is new.
    pub fn get_or_create(&self, key: &ClientKey) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.value().clone();
        }
        self.buckets
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(client = %key, capacity = self.capacity, "creating token bucket");
                Arc::new(TokenBucket::new(self.capacity, self.refill_rate, self.clock.clone()))
            })
            .value()
            .clone()
    }

    /// Existing bucket for `key`, if any.
    pub fn get(&self, key: &ClientKey) -> Option<Arc<TokenBucket>> {
        self.buckets.get(key).map(|b| b.value().clone())
    }

    pub fn contains(&self, key: &ClientKey) -> bool {
        self.buckets.contains_key(key)
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl
    }

    /// Remove idle, fully refilled buckets. Returns how many were removed.
    ///
    /// A bucket still referenced outside the map (a request is mid-decision) is kept, so a
    /// request can never consume from a bucket that has just been detached.
    pub fn evict_idle(&self) -> usize {
        let Some(ttl) = self.idle_ttl else {
            return 0;
        };
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let now = self.clock.now_millis();
        let mut evicted = 0;
        self.buckets.retain(|_, bucket| {
            let idle = bucket.idle_millis(now) >= ttl_millis
                && bucket.is_full_at(now)
                && Arc::strong_count(bucket) == 1;
            if idle {
                evicted += 1;
            }
            !idle
        });
        if evicted > 0 {
            debug!(evicted, remaining = self.buckets.len(), "evicted idle token buckets");
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` on the tokio runtime.
    ///
    /// The task stops on its own once the registry is dropped. A no-op loop is not spawned when
    /// no TTL is configured; the returned handle then completes immediately.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let enabled = self.idle_ttl.is_some();
        if !enabled {
            warn!("bucket sweeper requested without an idle TTL; nothing will be evicted");
        }
        tokio::spawn(async move {
            if !enabled {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.evict_idle();
            }
        })
    }
}

/// Per-client admission stage: one token bucket per [`ClientKey`].
#[derive(Debug, Clone)]
pub struct PerClientLimiter {
    registry: Arc<BucketRegistry>,
}

impl PerClientLimiter {
    pub fn new(registry: Arc<BucketRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }

    /// Synchronous decision for `key`.
    pub fn check(&self, key: &ClientKey) -> Decision {
        let decision = self.registry.get_or_create(key).try_acquire();
        if let Decision::Reject(rejection) = &decision {
            warn!(
                client = %key,
                cause = %rejection.cause,
                retry_after_secs = rejection.retry_after_secs(),
                "rate limit exceeded for client"
            );
        }
        decision
    }
}

#[async_trait]
impl RateLimiter for PerClientLimiter {
    async fn acquire(&self, key: &ClientKey) -> Decision {
        self.check(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::RejectCause;

    fn registry(clock: &ManualClock) -> BucketRegistry {
        BucketRegistry::new(3, 1.0).with_clock(clock.clone())
    }

    #[test]
    fn same_key_returns_same_bucket() {
        let clock = ManualClock::new();
        let registry = registry(&clock);
        let key = ClientKey::from("a");
        let first = registry.get_or_create(&key);
        let second = registry.get_or_create(&key);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_first_sight_creates_one_bucket() {
        let registry = Arc::new(registry(&ManualClock::new()));
        let key = ClientKey::from("burst");
        let barrier = Arc::new(std::sync::Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let key = key.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_create(&key)
                })
            })
            .collect();
        let buckets: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(buckets.iter().all(|b| Arc::ptr_eq(b, &buckets[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn clients_are_independent() {
        let clock = ManualClock::new();
        let limiter = PerClientLimiter::new(Arc::new(registry(&clock)));
        let noisy = ClientKey::from("noisy");
        let quiet = ClientKey::from("quiet");

        for _ in 0..3 {
            assert!(limiter.check(&noisy).is_admitted());
        }
        let rejected = limiter.check(&noisy);
        assert_eq!(rejected.rejection().map(|r| r.cause), Some(RejectCause::ClientExhausted));

        for _ in 0..3 {
            assert!(limiter.check(&quiet).is_admitted());
        }
    }

    #[test]
    fn eviction_disabled_without_ttl() {
        let clock = ManualClock::new();
        let registry = registry(&clock);
        registry.get_or_create(&ClientKey::from("a"));
        clock.advance(3_600_000);
        assert_eq!(registry.evict_idle(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn eviction_requires_idle_and_full() {
        let clock = ManualClock::new();
        let registry = registry(&clock).with_idle_ttl(Duration::from_secs(1));
        let drained = ClientKey::from("drained");
        let touched = ClientKey::from("touched");

        for _ in 0..3 {
            registry.get_or_create(&drained).try_consume();
        }
        registry.get_or_create(&touched);

        // Idle past the TTL, but the drained bucket has only refilled 2 of 3 tokens.
        clock.advance(2_000);
        assert_eq!(registry.evict_idle(), 1);
        assert!(registry.contains(&drained));
        assert!(!registry.contains(&touched));

        clock.advance(1_000);
        assert_eq!(registry.evict_idle(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn eviction_skips_buckets_in_use() {
        let clock = ManualClock::new();
        let registry = registry(&clock).with_idle_ttl(Duration::from_millis(10));
        let held = registry.get_or_create(&ClientKey::from("held"));
        clock.advance(100);
        assert_eq!(registry.evict_idle(), 0);
        drop(held);
        assert_eq!(registry.evict_idle(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_periodically_and_stops_with_registry() {
        let clock = ManualClock::new();
        let registry = Arc::new(registry(&clock).with_idle_ttl(Duration::from_secs(1)));
        registry.get_or_create(&ClientKey::from("a"));
        clock.advance(5_000);

        let handle = registry.spawn_sweeper(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(registry.is_empty());

        drop(registry);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(handle.is_finished());
    }
}
