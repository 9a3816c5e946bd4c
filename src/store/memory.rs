//! In-process bucket store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::BucketState;

use super::script::{parse_decimal, ScriptArgs, ScriptReply};
use super::BucketStore;

/// Drop expired records after this many script executions.
const SWEEP_EVERY: u64 = 1024;

/// One stored record, kept as strings the way a key-value store holds them.
#[derive(Debug, Clone)]
struct Record {
    tokens: String,
    last: String,
    expires_at: f64,
}

impl Record {
    fn parse(&self) -> Result<BucketState> {
        Ok(BucketState {
            tokens: parse_decimal("tokens", &self.tokens)?,
            last_refill: parse_decimal("last", &self.last)?,
        })
    }
}

/// A [`BucketStore`] living in this process.
///
/// Every script execution runs under one mutex, which gives the same
/// no-interleaving guarantee the server-side script has. Expiry is passive:
/// a record past its deadline (on the store's clock) reads as absent, and
/// expired records are dropped every [`SWEEP_EVERY`] executions.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    records: Arc<Mutex<HashMap<String, Record>>>,
    clock: Arc<dyn Clock>,
    evaluations: Arc<AtomicU64>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            clock,
            evaluations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Write a record verbatim, bypassing the script. Used to seed or migrate state.
    pub fn insert_raw(&self, key: &str, tokens: &str, last: &str, ttl_secs: f64) {
        let expires_at = self.clock.now() + ttl_secs;
        self.records.lock().insert(
            key.to_string(),
            Record {
                tokens: tokens.to_string(),
                last: last.to_string(),
                expires_at,
            },
        );
    }

    /// Remove expired records. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        Self::sweep(&mut self.records.lock(), now)
    }

    fn sweep(records: &mut HashMap<String, Record>, now: f64) -> usize {
        let before = records.len();
        records.retain(|_, r| r.expires_at > now);
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed = removed, remaining = records.len(), "Dropped expired records");
        }
        removed
    }

    /// Number of records, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl BucketStore for InMemoryStore {
    async fn load_script(&self) -> Result<()> {
        Ok(())
    }

    async fn eval_bucket(&self, key: &str, args: &ScriptArgs) -> Result<ScriptReply> {
        let store_now = self.clock.now();
        let mut records = self.records.lock();

        if (self.evaluations.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            Self::sweep(&mut records, store_now);
        }

        let existing = records
            .get(key)
            .filter(|r| r.expires_at > store_now)
            .map(Record::parse);

        let settled_at = args.settled_at.min(args.now);
        let created_at = if args.settled > 0.0 { settled_at } else { args.now };
        let mut state = match existing {
            Some(Ok(state)) => state,
            Some(Err(e)) => {
                warn!(key = %key, error = %e, "Resetting corrupt bucket record");
                BucketState::full(args.capacity, created_at)
            }
            None => BucketState::full(args.capacity, created_at),
        };
        state.tokens = state.tokens.clamp(0.0, args.capacity);

        if args.settled > 0.0 {
            state.refill(settled_at, args.capacity, args.refill_rate);
            state.tokens = (state.tokens - args.settled).max(0.0);
        }
        state.refill(args.now, args.capacity, args.refill_rate);

        let allowed = args.tokens_requested <= state.tokens;
        if allowed {
            state.tokens -= args.tokens_requested;
        }

        records.insert(
            key.to_string(),
            Record {
                tokens: state.tokens.to_string(),
                last: state.last_refill.to_string(),
                expires_at: store_now + args.ttl_ms() as f64 / 1000.0,
            },
        );

        debug!(key = %key, allowed = allowed, tokens = state.tokens, "Evaluated bucket");

        Ok(ScriptReply {
            allowed,
            tokens: state.tokens,
            last: state.last_refill,
        })
    }

    async fn read_state(&self, key: &str) -> Result<Option<BucketState>> {
        let now = self.clock.now();
        let records = self.records.lock();
        match records.get(key).filter(|r| r.expires_at > now) {
            Some(record) => record.parse().map(Some),
            None => Ok(None),
        }
    }

    fn purge_expired(&self) -> usize {
        InMemoryStore::purge_expired(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::TollgateError;
    use crate::ratelimit::BucketSettings;

    fn store() -> (InMemoryStore, ManualClock) {
        let clock = ManualClock::new(500.0);
        (InMemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    fn args(now: f64, requested: f64) -> ScriptArgs {
        let settings = BucketSettings::new(2.0, 1.0).unwrap();
        ScriptArgs::new(&settings, now, requested)
    }

    #[tokio::test]
    async fn test_absent_key_starts_full() {
        let (store, _) = store();

        let reply = store.eval_bucket("rl:u1", &args(500.0, 1.0)).await.unwrap();
        assert_eq!(
            reply,
            ScriptReply {
                allowed: true,
                tokens: 1.0,
                last: 500.0
            }
        );

        let state = store.read_state("rl:u1").await.unwrap().unwrap();
        assert_eq!(state.tokens, 1.0);
    }

    #[tokio::test]
    async fn test_denial_still_persists_refill() {
        let (store, _) = store();
        store.eval_bucket("k", &args(500.0, 2.0)).await.unwrap();

        // 0.5s later: refilled to 0.5, request of 1 denied
        let reply = store.eval_bucket("k", &args(500.5, 1.0)).await.unwrap();
        assert!(!reply.allowed);
        assert_eq!(reply.tokens, 0.5);
        assert_eq!(reply.last, 500.5);

        let state = store.read_state("k").await.unwrap().unwrap();
        assert_eq!(state.last_refill, 500.5);
        assert_eq!(state.tokens, 0.5);
    }

    #[tokio::test]
    async fn test_settled_tokens_are_deducted() {
        let (store, _) = store();

        let settled = args(500.0, 1.0).with_settled(1.5, 500.0);
        let reply = store.eval_bucket("k", &settled).await.unwrap();
        assert!(!reply.allowed);
        assert_eq!(reply.tokens, 0.5);

        // Deduction saturates at zero
        let reply = store.eval_bucket("k", &args(500.0, 0.0).with_settled(9.0, 500.0)).await.unwrap();
        assert_eq!(reply.tokens, 0.0);
    }

    #[tokio::test]
    async fn test_settled_tokens_earn_refill_since_admission() {
        let (store, _) = store();

        // One token left the bucket at 500; by 501 it has flowed back
        let reply = store
            .eval_bucket("k", &args(501.0, 2.0).with_settled(1.0, 500.0))
            .await
            .unwrap();
        assert!(reply.allowed);
        assert_eq!(reply.tokens, 0.0);
        assert_eq!(reply.last, 501.0);

        // Deducted at the call time instead, the same request is short
        let reply = store
            .eval_bucket("j", &args(501.0, 2.0).with_settled(1.0, 501.0))
            .await
            .unwrap();
        assert!(!reply.allowed);
        assert_eq!(reply.tokens, 1.0);
    }

    #[tokio::test]
    async fn test_expired_records_are_swept_without_purge_call() {
        let (store, clock) = store();
        for i in 0..2048 {
            store.eval_bucket(&format!("old-{}", i), &args(500.0, 1.0)).await.unwrap();
        }
        assert_eq!(store.len(), 2048);

        clock.advance(3600.0);
        let now = clock.now();
        for i in 0..1024 {
            store.eval_bucket(&format!("new-{}", i), &args(now, 1.0)).await.unwrap();
        }
        assert_eq!(store.len(), 1024);
    }

    #[tokio::test]
    async fn test_non_finite_record_is_reset_to_full() {
        let (store, _) = store();
        store.insert_raw("k", "1", "inf", 60.0);

        let reply = store.eval_bucket("k", &args(500.0, 1.0)).await.unwrap();
        assert!(reply.allowed);
        assert_eq!(reply.tokens, 1.0);
        assert_eq!(reply.last, 500.0);
    }

    #[tokio::test]
    async fn test_record_expires_after_ttl() {
        let (store, clock) = store();
        store.eval_bucket("k", &args(500.0, 2.0)).await.unwrap();

        // TTL = ceil(2 / 1 * 2) = 4s
        clock.advance(3.9);
        assert!(store.read_state("k").await.unwrap().is_some());

        clock.advance(0.2);
        assert!(store.read_state("k").await.unwrap().is_none());
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_reset_to_full() {
        let (store, _) = store();
        store.insert_raw("k", "not-a-number", "500", 60.0);

        assert!(matches!(
            store.read_state("k").await,
            Err(TollgateError::StateCorrupt(_))
        ));

        let reply = store.eval_bucket("k", &args(500.0, 1.0)).await.unwrap();
        assert!(reply.allowed);
        assert_eq!(reply.tokens, 1.0);
    }

    #[tokio::test]
    async fn test_out_of_range_tokens_are_clamped() {
        let (store, _) = store();
        store.insert_raw("k", "50", "500", 60.0);

        let reply = store.eval_bucket("k", &args(500.0, 0.0)).await.unwrap();
        assert_eq!(reply.tokens, 2.0);
    }
}
