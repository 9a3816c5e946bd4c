//! Shared bucket stores.
//!
//! A [`BucketStore`] holds the authoritative bucket state shared by every
//! limiter instance and runs the refill-and-consume procedure from
//! [`script`] atomically per key. [`RedisStore`] is the production backend;
//! [`InMemoryStore`] executes the same procedure inside the process.

mod memory;
mod redis_store;
pub mod script;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::BucketState;

pub use self::memory::InMemoryStore;
pub use self::redis_store::RedisStore;
pub use script::{ScriptArgs, ScriptReply, MAX_TTL_MS, TOKEN_BUCKET_LUA};

/// A store that executes the token-bucket script atomically per key.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Register the script with the store. Called once before first use.
    async fn load_script(&self) -> Result<()>;

    /// Run refill + consume for `key` as one indivisible operation.
    async fn eval_bucket(&self, key: &str, args: &ScriptArgs) -> Result<ScriptReply>;

    /// Read the stored record without modifying it. `None` if absent or expired.
    async fn read_state(&self, key: &str) -> Result<Option<BucketState>>;

    /// Drop expired records the store does not expire on its own. Returns how many.
    fn purge_expired(&self) -> usize {
        0
    }
}
