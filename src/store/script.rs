//! The atomic refill-and-consume script and its argument/reply contract.
//!
//! Wire contract, shared by every implementation talking to the same store:
//!
//! - `KEYS[1]`: the bucket key
//! - `ARGV[1..4]`: `capacity`, `refill_rate`, `now` (seconds), `tokens_requested`
//! - `ARGV[5]` (optional): tokens admitted elsewhere, to deduct
//! - `ARGV[6]` (optional): minimum expiry in milliseconds
//! - `ARGV[7]` (optional): time the `ARGV[5]` tokens were admitted, defaults to `now`
//!
//! The reply is `{allowed (1|0), tokens, last}`, with the two numbers as decimal
//! strings because the store truncates script numbers to integers. Callers that
//! only need the flag can read the first element.

use crate::error::{Result, TollgateError};
use crate::ratelimit::BucketSettings;

/// Upper bound on a record's expiry, about 31 years. Keeps huge capacity to
/// rate ratios representable as an integer millisecond count.
pub const MAX_TTL_MS: u64 = 1_000_000_000_000;

/// Server-side token bucket. Runs atomically inside the store.
pub const TOKEN_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local settled = tonumber(ARGV[5]) or 0
local min_ttl_ms = tonumber(ARGV[6]) or 0
local settled_at = tonumber(ARGV[7]) or now
if settled_at > now then
    settled_at = now
end

local function finite(v)
    return v ~= nil and v == v and v ~= math.huge and v ~= -math.huge
end

-- Anything that is not a well-formed bucket record is treated as absent.
local kind = redis.call('TYPE', key)['ok']
if kind ~= 'none' and kind ~= 'hash' then
    redis.call('DEL', key)
end

local data = redis.call('HMGET', key, 'tokens', 'last')
local tokens = tonumber(data[1])
local last = tonumber(data[2])
if not finite(tokens) or not finite(last) then
    tokens = capacity
    if settled > 0 then
        last = settled_at
    else
        last = now
    end
end
tokens = math.max(0, math.min(capacity, tokens))

local function refill(to)
    local elapsed = to - last
    if elapsed > 0 then
        tokens = math.min(capacity, tokens + elapsed * refill_rate)
        last = to
    end
end

-- Settled tokens left the bucket at settled_at, so refill credit after that counts.
if settled > 0 then
    refill(settled_at)
    tokens = math.max(0, tokens - settled)
end
refill(now)

local allowed = 0
if requested <= tokens then
    tokens = tokens - requested
    allowed = 1
end

local tokens_str = string.format('%.17g', tokens)
local last_str = string.format('%.17g', last)
redis.call('HSET', key, 'tokens', tokens_str, 'last', last_str)
local ttl_ms = math.ceil((capacity / refill_rate) * 2) * 1000
if min_ttl_ms > ttl_ms then
    ttl_ms = min_ttl_ms
end
if ttl_ms > 1000000000000 then
    ttl_ms = 1000000000000
end
redis.call('PEXPIRE', key, string.format('%d', ttl_ms))

return {allowed, tokens_str, last_str}
"#;

/// Positional arguments for one script execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptArgs {
    pub capacity: f64,
    pub refill_rate: f64,
    /// Caller's clock, seconds
    pub now: f64,
    pub tokens_requested: f64,
    /// Tokens already admitted on a local fast path, deducted before the decision
    pub settled: f64,
    pub min_ttl_ms: u64,
    /// When the `settled` tokens left the bucket, seconds. Never after `now`.
    pub settled_at: f64,
}

impl ScriptArgs {
    pub fn new(settings: &BucketSettings, now: f64, tokens_requested: f64) -> Self {
        Self {
            capacity: settings.capacity(),
            refill_rate: settings.refill_rate(),
            now,
            tokens_requested,
            settled: 0.0,
            min_ttl_ms: settings
                .min_ttl()
                .map(|ttl| ttl.as_millis() as u64)
                .unwrap_or(0),
            settled_at: now,
        }
    }

    /// Deduct `settled` tokens that were admitted at `settled_at`.
    pub fn with_settled(mut self, settled: f64, settled_at: f64) -> Self {
        self.settled = settled;
        self.settled_at = settled_at.min(self.now);
        self
    }

    /// Expiry applied by the script, in milliseconds.
    pub fn ttl_ms(&self) -> u64 {
        let derived = ((self.capacity / self.refill_rate * 2.0).ceil() as u64).saturating_mul(1000);
        derived.max(self.min_ttl_ms).min(MAX_TTL_MS)
    }

    /// The `ARGV` list in wire order.
    pub fn to_argv(&self) -> Vec<String> {
        vec![
            self.capacity.to_string(),
            self.refill_rate.to_string(),
            self.now.to_string(),
            self.tokens_requested.to_string(),
            self.settled.to_string(),
            self.min_ttl_ms.to_string(),
            self.settled_at.to_string(),
        ]
    }
}

/// Decoded script reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptReply {
    pub allowed: bool,
    /// Tokens left after the operation
    pub tokens: f64,
    /// Timestamp of the last refill, seconds
    pub last: f64,
}

impl ScriptReply {
    /// Decode the raw `{flag, tokens, last}` triple.
    pub fn parse(flag: i64, tokens: &str, last: &str) -> Result<Self> {
        let allowed = match flag {
            1 => true,
            0 => false,
            other => {
                return Err(TollgateError::StoreUnavailable(format!(
                    "unexpected script flag {}",
                    other
                )))
            }
        };
        let tokens = parse_decimal("tokens", tokens)
            .map_err(|e| TollgateError::StoreUnavailable(e.to_string()))?;
        let last = parse_decimal("last", last)
            .map_err(|e| TollgateError::StoreUnavailable(e.to_string()))?;

        Ok(Self {
            allowed,
            tokens,
            last,
        })
    }
}

/// Parse a stored decimal field. Lua may render `inf`/`nan`, which are rejected.
pub(crate) fn parse_decimal(field: &str, raw: &str) -> Result<f64> {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(TollgateError::StateCorrupt(format!(
            "field {} has unparseable value {:?}",
            field, raw
        ))),
    }
}
