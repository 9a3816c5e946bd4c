//! Distributed rate limiter backed by a shared bucket store.
//!
//! All refill/consume arithmetic happens inside the store's atomic script;
//! this side only supplies the clock reading and interprets the reply.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::FallbackPolicy;
use crate::error::{Result, TollgateError};
use crate::store::{BucketStore, ScriptArgs};

use super::backend::RateLimiterBackend;
use super::bucket::{BucketSettings, BucketState};
use super::verdict::Verdict;

/// Default bound on a single store round-trip.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);
/// Default prefix for store keys.
const DEFAULT_KEY_PREFIX: &str = "rl:";

/// A rate limiter whose state lives in a [`BucketStore`] shared by many processes.
pub struct SharedStoreLimiter<S> {
    store: Arc<S>,
    settings: BucketSettings,
    fallback: FallbackPolicy,
    timeout: Duration,
    key_prefix: String,
    clock: Arc<dyn Clock>,
    /// Set once the script has been registered with the store.
    loaded: OnceCell<()>,
}

impl<S: BucketStore> SharedStoreLimiter<S> {
    /// Create a new shared-store limiter with a permissive fallback.
    pub fn new(store: Arc<S>, settings: BucketSettings) -> Self {
        Self {
            store,
            settings,
            fallback: FallbackPolicy::Allow,
            timeout: DEFAULT_TIMEOUT,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            clock: Arc::new(SystemClock),
            loaded: OnceCell::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &BucketSettings {
        &self.settings
    }

    pub fn fallback(&self) -> FallbackPolicy {
        self.fallback
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register the script with the store. Runs at most once; later calls are no-ops.
    pub async fn init(&self) -> Result<()> {
        self.loaded
            .get_or_try_init(|| async {
                tokio::time::timeout(self.timeout, self.store.load_script())
                    .await
                    .map_err(|_| self.timed_out("script registration"))??;
                info!(
                    capacity = self.settings.capacity(),
                    refill_rate = self.settings.refill_rate(),
                    "Shared store limiter ready"
                );
                Ok::<(), TollgateError>(())
            })
            .await?;
        Ok(())
    }

    /// Consume `tokens` for `key`, applying the fallback policy if the store fails.
    pub async fn consume(&self, key: &str, tokens: u32) -> Verdict {
        match self.try_consume(key, tokens).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(key = %key, error = %e, policy = ?self.fallback, "Shared store failed, using fallback");
                self.fallback_verdict(tokens as f64)
            }
        }
    }

    /// Consume `tokens` for `key`, surfacing store failures to the caller.
    pub async fn try_consume(&self, key: &str, tokens: u32) -> Result<Verdict> {
        self.authorize(key, tokens as f64, None).await
    }

    /// Run the script for `key`. `settled` is a `(tokens, admitted_at)` pair of
    /// tokens admitted elsewhere, deducted as of `admitted_at`.
    pub(crate) async fn authorize(
        &self,
        key: &str,
        amount: f64,
        settled: Option<(f64, f64)>,
    ) -> Result<Verdict> {
        self.init().await?;

        let store_key = self.store_key(key);
        let mut args = ScriptArgs::new(&self.settings, self.clock.now(), amount);
        if let Some((tokens, admitted_at)) = settled {
            args = args.with_settled(tokens, admitted_at);
        }

        trace!(key = %store_key, amount = amount, settled = args.settled, "Checking shared rate limit");

        let reply = tokio::time::timeout(self.timeout, self.store.eval_bucket(&store_key, &args))
            .await
            .map_err(|_| self.timed_out("bucket script"))??;

        let verdict = Verdict::from_store(reply.allowed, reply.tokens, amount, &self.settings);
        if !verdict.allowed {
            debug!(
                key = %store_key,
                tokens = reply.tokens,
                retry_after_ms = verdict.retry_after_ms,
                "Shared rate limit exceeded"
            );
        }
        Ok(verdict)
    }

    /// The verdict handed out when the store cannot be consulted.
    pub fn fallback_verdict(&self, amount: f64) -> Verdict {
        match self.fallback {
            FallbackPolicy::Allow => Verdict::allow(None),
            FallbackPolicy::Deny => Verdict::deny(None, self.settings.retry_after_ms(amount.max(1.0))),
        }
    }

    /// Best-effort read of the stored record for `key`.
    pub async fn get_state(&self, key: &str) -> Option<BucketState> {
        let store_key = self.store_key(key);
        match tokio::time::timeout(self.timeout, self.store.read_state(&store_key)).await {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                debug!(key = %store_key, error = %e, "Bucket state not available");
                None
            }
            Err(_) => {
                debug!(key = %store_key, "Bucket state read timed out");
                None
            }
        }
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn timed_out(&self, what: &str) -> TollgateError {
        TollgateError::StoreUnavailable(format!("{} timed out after {:?}", what, self.timeout))
    }
}

#[async_trait]
impl<S: BucketStore + 'static> RateLimiterBackend for SharedStoreLimiter<S> {
    async fn consume(&self, key: &str, tokens: u32) -> Verdict {
        SharedStoreLimiter::consume(self, key, tokens).await
    }

    async fn get_state(&self, key: &str) -> Option<BucketState> {
        SharedStoreLimiter::get_state(self, key).await
    }

    fn purge_idle(&self) -> usize {
        self.store.purge_expired()
    }

    fn name(&self) -> &'static str {
        "shared"
    }
}
