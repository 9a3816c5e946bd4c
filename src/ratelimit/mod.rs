//! Token-bucket admission control.

mod backend;
mod bucket;
mod handle;
mod hybrid;
mod memory;
mod shared;
mod verdict;

pub use backend::RateLimiterBackend;
pub use bucket::{Admission, BucketSettings, BucketState, LocalBucket};
pub use handle::{initialize, initialize_with_store, LimiterHandle};
pub use hybrid::HybridLimiter;
pub use memory::MemoryLimiter;
pub use shared::SharedStoreLimiter;
pub use verdict::Verdict;
