//! Admission strategies and the limiters composed from them.

mod adaptive;
mod concurrency;
mod distributed;
mod fixed_window;
mod keyed;
mod leaky_bucket;
mod sliding_window;
mod strategy;
mod token_bucket;

pub use adaptive::{AdaptiveLimiter, Adjustment, Outcome, OutcomeCounts};
pub use concurrency::{ConcurrencyLimiter, Permit};
pub use distributed::{Decision, DistributedLimiter};
pub use fixed_window::FixedWindowCounter;
pub use keyed::KeyedLimiter;
pub use leaky_bucket::{LeakyBucket, QueueStats, Ticket};
pub use sliding_window::SlidingWindowLog;
pub use strategy::{build_limiter, Admission, Limiter};
pub use token_bucket::TokenBucket;
