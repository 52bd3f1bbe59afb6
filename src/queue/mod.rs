pub mod item;
pub mod producer;
pub mod store;

pub use item::{CrawlOptions, QueueItem};
pub use producer::{
    ChannelProducer, MemoryProducer, Producer, ProducerError, QueueProducer, TaskProducer,
};
pub use store::{DurableQueue, FailedItem, Lease, QueueError, QueueStats};
