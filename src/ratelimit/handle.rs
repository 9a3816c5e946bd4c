//! Building a limiter from configuration.

use std::sync::Arc;

use tracing::info;

use crate::config::TollgateConfig;
use crate::error::Result;
use crate::store::{BucketStore, InMemoryStore, RedisStore};

use super::backend::RateLimiterBackend;
use super::bucket::{BucketSettings, BucketState};
use super::hybrid::HybridLimiter;
use super::memory::MemoryLimiter;
use super::shared::SharedStoreLimiter;
use super::verdict::Verdict;

/// Endpoint scheme selecting the in-process store.
const MEMORY_SCHEME: &str = "memory://";

/// A ready-to-use limiter, whichever backend the configuration selected.
#[derive(Clone)]
pub struct LimiterHandle {
    backend: Arc<dyn RateLimiterBackend>,
}

impl std::fmt::Debug for LimiterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterHandle")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl LimiterHandle {
    pub fn new(backend: Arc<dyn RateLimiterBackend>) -> Self {
        Self { backend }
    }

    /// Consume `tokens` for `key`. Never fails; see [`RateLimiterBackend::consume`].
    pub async fn consume(&self, key: &str, tokens: u32) -> Verdict {
        self.backend.consume(key, tokens).await
    }

    /// Best-effort bucket introspection.
    pub async fn get_state(&self, key: &str) -> Option<BucketState> {
        self.backend.get_state(key).await
    }

    /// `memory`, `shared` or `hybrid`.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn purge_idle(&self) -> usize {
        self.backend.purge_idle()
    }
}

/// Build a limiter from configuration.
///
/// Without a store endpoint this is a [`MemoryLimiter`]. With one, the store
/// is connected and the script registered before returning, and the limiter is
/// a [`HybridLimiter`] unless the local fast path is disabled.
pub async fn initialize(config: &TollgateConfig) -> Result<LimiterHandle> {
    config.validate()?;
    let settings = BucketSettings::from_config(&config.limiter)?;

    let endpoint = config
        .store
        .endpoint
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty());

    match endpoint {
        None => {
            info!(
                capacity = settings.capacity(),
                refill_rate = settings.refill_rate(),
                "Using in-memory limiter"
            );
            Ok(LimiterHandle::new(Arc::new(MemoryLimiter::new(settings))))
        }
        Some(endpoint) if endpoint.starts_with(MEMORY_SCHEME) => {
            initialize_with_store(config, Arc::new(InMemoryStore::new())).await
        }
        Some(endpoint) => {
            let store = RedisStore::connect(endpoint, config.store.timeout()).await?;
            initialize_with_store(config, Arc::new(store)).await
        }
    }
}

/// Build a shared-store or hybrid limiter on top of an existing store.
pub async fn initialize_with_store<S: BucketStore + 'static>(
    config: &TollgateConfig,
    store: Arc<S>,
) -> Result<LimiterHandle> {
    config.validate()?;
    let settings = BucketSettings::from_config(&config.limiter)?;

    let shared = SharedStoreLimiter::new(store, settings)
        .with_fallback(config.limiter.fallback_on_store_error)
        .with_timeout(config.store.timeout())
        .with_key_prefix(config.store.key_prefix.clone());
    shared.init().await?;

    let backend: Arc<dyn RateLimiterBackend> = if config.limiter.local_fast_path {
        let hybrid = HybridLimiter::new(shared).with_settlement(config.limiter.settle_local_admissions);
        info!(instance = %hybrid.instance_id(), "Using hybrid limiter");
        Arc::new(hybrid)
    } else {
        info!("Using shared store limiter");
        Arc::new(shared)
    };

    Ok(LimiterHandle::new(backend))
}
