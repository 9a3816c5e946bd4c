//! Local fast path in front of a shared store.
//!
//! Requests are first checked against a process-local bucket sized like the
//! shared one. A local admission returns immediately without a store
//! round-trip. A local denial is not final: the store is asked, since other
//! processes may not have used their share of the global quota.
//!
//! With N processes, a burst can transiently be admitted up to N times over
//! before the store catches up. Tokens admitted locally are remembered per key
//! and deducted by the store on that key's next round-trip, which bounds the
//! skew to one local bucket per process between round-trips.
//!
//! A denial reports the larger of the local and shared token counts, since the
//! request goes through as soon as either bucket can cover it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::store::BucketStore;

use super::backend::RateLimiterBackend;
use super::bucket::{Admission, BucketState};
use super::memory::{MemoryLimiter, SWEEP_EVERY};
use super::shared::SharedStoreLimiter;
use super::verdict::Verdict;

/// Tokens admitted locally that the shared store has not seen yet.
#[derive(Debug, Clone, Copy)]
struct Unsettled {
    tokens: f64,
    /// Time of the most recent local admission
    since: f64,
}

/// A limiter that tries a [`MemoryLimiter`] before a [`SharedStoreLimiter`].
pub struct HybridLimiter<S> {
    /// Identifies this process in log events
    instance_id: Uuid,
    local: MemoryLimiter,
    shared: SharedStoreLimiter<S>,
    settle: bool,
    unsettled: DashMap<String, Unsettled>,
    /// Unsettled entries created so far, drives the stale-entry sweep
    recorded: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl<S: BucketStore> HybridLimiter<S> {
    /// Wrap `shared` with a local bucket of the same capacity, rate and clock.
    pub fn new(shared: SharedStoreLimiter<S>) -> Self {
        let clock = Arc::clone(shared.clock());
        let local = MemoryLimiter::with_clock(*shared.settings(), Arc::clone(&clock));
        Self {
            instance_id: Uuid::new_v4(),
            local,
            shared,
            settle: true,
            unsettled: DashMap::new(),
            recorded: AtomicU64::new(0),
            clock,
        }
    }

    /// Whether locally admitted tokens are deducted by the store later. On by default.
    pub fn with_settlement(mut self, settle: bool) -> Self {
        self.settle = settle;
        self
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn local(&self) -> &MemoryLimiter {
        &self.local
    }

    pub fn shared(&self) -> &SharedStoreLimiter<S> {
        &self.shared
    }

    /// Register the store script.
    pub async fn init(&self) -> Result<()> {
        self.shared.init().await
    }

    /// Consume `tokens` for `key`: local bucket first, shared store on local denial.
    pub async fn consume(&self, key: &str, tokens: u32) -> Verdict {
        let amount = tokens as f64;
        let now = self.clock.now();

        let available = match self.local.consume_at(key, amount, now) {
            Admission::Allowed { remaining } => {
                if self.settle && amount > 0.0 {
                    self.record_unsettled(key, amount, now);
                }
                trace!(instance = %self.instance_id, key = %key, remaining = remaining, "Admitted on fast path");
                return Verdict::allow(Some(remaining));
            }
            Admission::Denied { available, .. } => available,
        };

        let pending = self.take_unsettled(key, now);
        let settled = pending.map(|p| (p.tokens, p.since));

        match self.shared.authorize(key, amount, settled).await {
            Ok(verdict) if verdict.allowed => verdict,
            Ok(verdict) => {
                let shared = verdict.tokens_remaining.unwrap_or(0.0);
                Verdict::from_store(false, shared.max(available), amount, self.shared.settings())
            }
            Err(e) => {
                if let Some(pending) = pending {
                    self.restore_unsettled(key, pending);
                }
                warn!(
                    instance = %self.instance_id,
                    key = %key,
                    error = %e,
                    policy = ?self.shared.fallback(),
                    "Shared store failed, using fallback"
                );
                self.shared.fallback_verdict(amount)
            }
        }
    }

    /// State from the shared store, or the local bucket if the store has none.
    pub async fn get_state(&self, key: &str) -> Option<BucketState> {
        match self.shared.get_state(key).await {
            Some(state) => Some(state),
            None => self.local.get_state(key),
        }
    }

    /// Tokens admitted locally for `key` and not yet shipped to the store.
    pub fn unsettled(&self, key: &str) -> f64 {
        self.unsettled.get(key).map(|u| u.tokens).unwrap_or(0.0)
    }

    /// Number of keys with unsettled tokens.
    pub fn unsettled_len(&self) -> usize {
        self.unsettled.len()
    }

    /// Drop idle local buckets, stale unsettled counts and expired store records.
    pub fn purge_idle(&self) -> usize {
        let removed = self.local.purge_idle();
        self.sweep_unsettled(self.clock.now());
        removed + self.shared.store().purge_expired()
    }

    fn sweep_unsettled(&self, now: f64) {
        let ttl = self.shared.settings().idle_ttl().as_secs_f64();
        let before = self.unsettled.len();
        self.unsettled.retain(|_, u| now - u.since <= ttl);

        let removed = before.saturating_sub(self.unsettled.len());
        if removed > 0 {
            debug!(instance = %self.instance_id, removed = removed, "Dropped stale unsettled tokens");
        }
    }

    fn record_unsettled(&self, key: &str, amount: f64, now: f64) {
        let mut inserted = false;
        {
            let mut entry = self.unsettled.entry(key.to_string()).or_insert_with(|| {
                inserted = true;
                Unsettled {
                    tokens: 0.0,
                    since: now,
                }
            });
            entry.tokens += amount;
            entry.since = entry.since.max(now);
        }

        if inserted && (self.recorded.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.sweep_unsettled(now);
        }
    }

    fn take_unsettled(&self, key: &str, now: f64) -> Option<Unsettled> {
        let (_, pending) = self.unsettled.remove(key)?;

        // The store record has expired since; deducting would double count refilled tokens.
        let ttl = self.shared.settings().idle_ttl().as_secs_f64();
        if now - pending.since > ttl {
            debug!(instance = %self.instance_id, key = %key, tokens = pending.tokens, "Discarding stale unsettled tokens");
            return None;
        }
        Some(pending)
    }

    fn restore_unsettled(&self, key: &str, pending: Unsettled) {
        let mut entry = self.unsettled.entry(key.to_string()).or_insert(Unsettled {
            tokens: 0.0,
            since: pending.since,
        });
        entry.tokens += pending.tokens;
        entry.since = entry.since.max(pending.since);
    }
}

#[async_trait]
impl<S: BucketStore + 'static> RateLimiterBackend for HybridLimiter<S> {
    async fn consume(&self, key: &str, tokens: u32) -> Verdict {
        HybridLimiter::consume(self, key, tokens).await
    }

    async fn get_state(&self, key: &str) -> Option<BucketState> {
        HybridLimiter::get_state(self, key).await
    }

    fn purge_idle(&self) -> usize {
        HybridLimiter::purge_idle(self)
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}
