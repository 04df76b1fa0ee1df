pub mod bucket;
pub mod queue;

pub use bucket::TokenBucket;
pub use queue::{OutboundQueue, QueueConfig, QueueItem};
