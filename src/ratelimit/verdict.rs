//! The answer handed back to callers.

use serde::Serialize;

use super::bucket::{Admission, BucketSettings};

/// Result of a consume call.
///
/// `retry_after_ms` is 0 whenever the request is allowed. For a denial it is the
/// minimum wait before the same request could succeed, assuming no other consumption.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    /// Tokens left in the bucket, when known. Fallback verdicts carry `None`.
    pub tokens_remaining: Option<f64>,
    pub retry_after_ms: u64,
}

impl Verdict {
    pub fn allow(tokens_remaining: Option<f64>) -> Self {
        Self {
            allowed: true,
            tokens_remaining,
            retry_after_ms: 0,
        }
    }

    pub fn deny(tokens_remaining: Option<f64>, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            tokens_remaining,
            retry_after_ms,
        }
    }

    /// Convert a local bucket outcome.
    pub fn from_admission(admission: Admission) -> Self {
        match admission {
            Admission::Allowed { remaining } => Verdict::allow(Some(remaining)),
            Admission::Denied {
                available,
                wait_secs,
            } => Verdict::deny(Some(available), (wait_secs * 1000.0).ceil() as u64),
        }
    }

    /// Build a verdict from the post-operation token count reported by the shared store.
    pub fn from_store(allowed: bool, tokens: f64, amount: f64, settings: &BucketSettings) -> Self {
        if allowed {
            Verdict::allow(Some(tokens))
        } else {
            Verdict::deny(Some(tokens), settings.retry_after_ms(amount - tokens))
        }
    }
}
