//! Task execution: the poller feeding the queue and the workers draining it

pub mod consumer;
pub mod poller;
pub mod pool;

pub use consumer::{Consumer, Outcome, error_chain};
pub use poller::{POLLER_SOURCE, PollStats, TaskPoller};
pub use pool::{PoolSettings, WorkerPool};
