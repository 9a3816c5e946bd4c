//! Tollgate - Token-Bucket Rate Limiting
//!
//! This crate enforces per-key request quotas with the token-bucket algorithm.
//! Buckets live either in process memory or in a shared store (Redis) that
//! applies refill and consume atomically through a server-side script, so many
//! limiter instances can share one quota. A hybrid mode answers from a local
//! bucket first and only consults the shared store on local denial.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use config::{FallbackPolicy, TollgateConfig};
pub use error::{Result, TollgateError};
pub use ratelimit::{initialize, BucketState, LimiterHandle, Verdict};
