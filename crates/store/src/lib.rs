//! Beacon store: the deduplicating, rate-limited work queue that sits between an
//! informer and its workers, and the indexer holding the last-seen object per key.

#![forbid(unsafe_code)]

mod indexer;
mod limiter;
mod queue;

pub use indexer::Indexer;
pub use limiter::ExponentialBackoff;
pub use queue::WorkQueue;
