//! In-process rate limiter for single-instance deployments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};

use super::backend::RateLimiterBackend;
use super::bucket::{Admission, BucketSettings, BucketState, LocalBucket};
use super::verdict::Verdict;

/// Run an idle sweep after this many buckets have been created.
pub(super) const SWEEP_EVERY: u64 = 1024;

/// A map from rate-limit key to [`LocalBucket`].
///
/// Buckets are created full on first use and swept once idle for longer than
/// the configured TTL. The map is sharded (`DashMap`) and each bucket carries
/// its own lock, so unrelated keys do not contend.
pub struct MemoryLimiter {
    settings: BucketSettings,
    buckets: DashMap<String, Arc<LocalBucket>>,
    clock: Arc<dyn Clock>,
    created: AtomicU64,
}

impl MemoryLimiter {
    /// Create a limiter on the system clock.
    pub fn new(settings: BucketSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: BucketSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            buckets: DashMap::new(),
            clock,
            created: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &BucketSettings {
        &self.settings
    }

    /// Consume `tokens` from the key's bucket, creating it full if absent.
    pub fn consume(&self, key: &str, tokens: u32) -> Verdict {
        let admission = self.consume_at(key, tokens as f64, self.clock.now());
        Verdict::from_admission(admission)
    }

    /// Consume at an explicit time.
    pub fn consume_at(&self, key: &str, amount: f64, now: f64) -> Admission {
        let bucket = self.bucket(key, now);
        let admission = bucket.consume_at(now, amount);

        trace!(key = %key, amount = amount, admission = ?admission, "Local bucket decision");
        admission
    }

    /// Current state of the key's bucket, refilled to now. `None` for unknown keys.
    pub fn get_state(&self, key: &str) -> Option<BucketState> {
        let now = self.clock.now();
        self.buckets.get(key).map(|b| b.snapshot_at(now))
    }

    /// Drop buckets idle for longer than the TTL. Returns how many were removed.
    pub fn purge_idle(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();

        // A bucket still referenced outside the map has a request in flight.
        self.buckets
            .retain(|_, bucket| Arc::strong_count(bucket) > 1 || !bucket.is_idle(now));

        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed = removed, remaining = self.buckets.len(), "Purged idle buckets");
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    /// Get the number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    fn bucket(&self, key: &str, now: f64) -> Arc<LocalBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let mut inserted = false;
        let bucket = Arc::clone(
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    inserted = true;
                    debug!(
                        key = %key,
                        capacity = self.settings.capacity(),
                        refill_rate = self.settings.refill_rate(),
                        "Creating new bucket"
                    );
                    Arc::new(LocalBucket::new(self.settings, now))
                })
                .value(),
        );

        if inserted && (self.created.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.purge_idle();
        }
        bucket
    }
}

#[async_trait]
impl RateLimiterBackend for MemoryLimiter {
    async fn consume(&self, key: &str, tokens: u32) -> Verdict {
        MemoryLimiter::consume(self, key, tokens)
    }

    async fn get_state(&self, key: &str) -> Option<BucketState> {
        MemoryLimiter::get_state(self, key)
    }

    fn purge_idle(&self) -> usize {
        MemoryLimiter::purge_idle(self)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn limiter(capacity: f64, rate: f64) -> (MemoryLimiter, ManualClock) {
        let clock = ManualClock::new(1_000.0);
        let settings = BucketSettings::new(capacity, rate).unwrap();
        (MemoryLimiter::with_clock(settings, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_limiter_creation() {
        let (limiter, _) = limiter(3.0, 1.0);
        assert!(limiter.is_empty());
        assert!(limiter.get_state("nobody").is_none());
    }

    #[test]
    fn test_consume_creates_full_bucket() {
        let (limiter, _) = limiter(3.0, 1.0);

        let verdict = limiter.consume("client-ip:/ping", 1);
        assert_eq!(verdict, Verdict::allow(Some(2.0)));
        assert_eq!(limiter.len(), 1);

        let state = limiter.get_state("client-ip:/ping").unwrap();
        assert_eq!(state.tokens, 2.0);
        assert_eq!(state.last_refill, 1_000.0);
    }

    #[test]
    fn test_capacity_three_scenario() {
        let (limiter, clock) = limiter(3.0, 1.0);

        for _ in 0..3 {
            assert!(limiter.consume("k", 1).allowed);
        }

        let denied = limiter.consume("k", 1);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, 1000);

        clock.advance(1.0);
        assert!(limiter.consume("k", 1).allowed);
    }

    #[test]
    fn test_retry_after_is_exact() {
        let (limiter, clock) = limiter(5.0, 4.0);
        assert!(limiter.consume("k", 5).allowed);

        let denied = limiter.consume("k", 2);
        assert_eq!(denied.retry_after_ms, 500);

        clock.advance(0.25);
        assert!(!limiter.consume("k", 2).allowed);

        // consume above did not spend anything; 0.5s total gives 2 tokens
        clock.advance(0.25);
        assert!(limiter.consume("k", 2).allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _) = limiter(2.0, 1.0);

        assert!(limiter.consume("a", 2).allowed);
        assert!(!limiter.consume("a", 1).allowed);
        assert!(limiter.consume("b", 2).allowed);
    }

    #[test]
    fn test_concurrent_consumers_never_double_spend() {
        const N: usize = 64;
        // Frozen clock: no refill during the run
        let (limiter, _) = limiter(N as f64, 1.0);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..N * 2)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.consume("shared", 1).allowed)
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(allowed, N);
        assert_eq!(limiter.get_state("shared").unwrap().tokens, 0.0);
    }

    #[test]
    fn test_purge_idle_removes_only_expired() {
        let (limiter, clock) = limiter(3.0, 1.0);
        limiter.consume("old", 1);

        clock.advance(5.0);
        limiter.consume("fresh", 1);

        // "old" is now 7s idle against a 6s TTL, "fresh" is 2s idle
        clock.advance(2.0);
        assert_eq!(limiter.purge_idle(), 1);
        assert!(!limiter.contains("old"));
        assert!(limiter.contains("fresh"));
    }

    #[test]
    fn test_idle_key_comes_back_full() {
        let (limiter, clock) = limiter(3.0, 1.0);
        limiter.consume("k", 3);

        clock.advance(Duration::from_secs(7).as_secs_f64());
        limiter.purge_idle();

        assert_eq!(limiter.consume("k", 1), Verdict::allow(Some(2.0)));
    }

    #[tokio::test]
    async fn test_backend_trait() {
        let (limiter, _) = limiter(1.0, 1.0);
        let backend: &dyn RateLimiterBackend = &limiter;

        assert!(backend.consume("k", 1).await.allowed);
        assert!(!backend.consume("k", 1).await.allowed);
        assert_eq!(backend.name(), "memory");
    }

    #[tokio::test]
    async fn test_clear() {
        let (limiter, _) = limiter(1.0, 1.0);
        limiter.consume("k", 1);
        assert_eq!(limiter.len(), 1);

        limiter.clear();
        assert!(limiter.is_empty());
    }
}
