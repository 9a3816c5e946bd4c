//! Redis-backed bucket store.
//!
//! The token-bucket procedure runs as a Lua script inside Redis, which
//! executes scripts one at a time, so no two limiter instances can interleave
//! a read-modify-write on the same key.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info, warn};

use crate::error::{Result, TollgateError};
use crate::ratelimit::BucketState;

use super::script::{parse_decimal, ScriptArgs, ScriptReply, TOKEN_BUCKET_LUA};
use super::BucketStore;

/// Handle to a Redis server holding bucket records.
///
/// Each record is a hash with fields `tokens` and `last` (decimal strings)
/// and a native expiry of the bucket's idle TTL.
#[derive(Clone)]
pub struct RedisStore {
    /// Endpoint, kept for logging
    endpoint: String,
    /// Reconnecting multiplexed connection, cheap to clone.
    conn: ConnectionManager,
    script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("endpoint", &self.endpoint)
            .field("script", &self.script.get_hash())
            .finish()
    }
}

impl RedisStore {
    /// Connect to `endpoint` (`redis://` or `rediss://` URL).
    pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Self> {
        info!(endpoint = %endpoint, "Connecting to shared store");

        let client = Client::open(endpoint)
            .map_err(|e| TollgateError::InvalidConfiguration(format!("bad store endpoint: {}", e)))?;

        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                TollgateError::StoreUnavailable(format!(
                    "connecting to {} timed out after {:?}",
                    endpoint, timeout
                ))
            })??;

        Ok(Self {
            endpoint: endpoint.to_string(),
            conn,
            script: Script::new(TOKEN_BUCKET_LUA),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn load_script(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let sha: String = self.script.prepare_invoke().load_async(&mut conn).await?;
        info!(sha = %sha, "Registered token bucket script");
        Ok(())
    }

    async fn eval_bucket(&self, key: &str, args: &ScriptArgs) -> Result<ScriptReply> {
        let mut invocation = self.script.prepare_invoke();
        invocation.key(key);
        for arg in args.to_argv() {
            invocation.arg(arg);
        }

        // EVALSHA, falling back to a reload if the server lost the script
        let mut conn = self.conn.clone();
        let (flag, tokens, last): (i64, String, String) = invocation.invoke_async(&mut conn).await?;

        debug!(key = %key, flag = flag, tokens = %tokens, "Evaluated bucket script");
        ScriptReply::parse(flag, &tokens, &last)
    }

    async fn read_state(&self, key: &str) -> Result<Option<BucketState>> {
        let mut conn = self.conn.clone();
        let (tokens, last): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(key)
            .arg("tokens")
            .arg("last")
            .query_async(&mut conn)
            .await?;

        match (tokens, last) {
            (Some(tokens), Some(last)) => Ok(Some(BucketState {
                tokens: parse_decimal("tokens", &tokens)?,
                last_refill: parse_decimal("last", &last)?,
            })),
            (None, None) => Ok(None),
            (tokens, last) => {
                warn!(key = %key, tokens = ?tokens, last = ?last, "Partial bucket record");
                Err(TollgateError::StateCorrupt(format!(
                    "record {} is missing a field",
                    key
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_endpoint_rejected() {
        let err = RedisStore::connect("not a url", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_store_failure() {
        // Port 1 is reserved; nothing listens there
        let err = RedisStore::connect("redis://127.0.0.1:1/", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(err.is_store_failure());
    }
}
