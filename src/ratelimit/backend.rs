//! Rate limiter trait for abstracting local, shared-store and hybrid implementations.

use async_trait::async_trait;

use super::bucket::BucketState;
use super::verdict::Verdict;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over [`MemoryLimiter`](super::MemoryLimiter),
/// [`SharedStoreLimiter`](super::SharedStoreLimiter) and
/// [`HybridLimiter`](super::HybridLimiter) so callers can hold any of them
/// behind a [`LimiterHandle`](super::LimiterHandle).
///
/// `consume` never fails: shared-store problems are turned into the
/// configured fallback verdict before they reach the caller.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Try to take `tokens` from the bucket for `key`.
    async fn consume(&self, key: &str, tokens: u32) -> Verdict;

    /// Best-effort view of a key's bucket. `None` when the key is unknown or
    /// the state cannot be read.
    async fn get_state(&self, key: &str) -> Option<BucketState>;

    /// Evict idle process-local state. Returns the number of entries removed.
    fn purge_idle(&self) -> usize {
        0
    }

    /// Short backend name for status reporting.
    fn name(&self) -> &'static str;
}
