/// Task ledger: durable task records and their status history
///
/// Each task carries its crawl parameters, the options it was submitted with,
/// an append-only diagnostic trail (`more_info`) and the latest diff recorded
/// by its crawler. Status changes are checked against the task state machine
/// on every write.
///
/// The ledger also keeps the last harvested version of each entity
/// ("snapshots") so crawlers can diff consecutive runs.
///
/// ## Usage
///
/// ```rust,ignore
/// use crawlbox::ledger::{FjallTaskStore, NewTask, TaskStore};
///
/// let store = FjallTaskStore::open("data/ledger")?;
/// let task = store.create(NewTask::builder().kind("fetch").build())?;
/// let same = store.get(&task.task_id)?;
/// ```
pub mod error;
pub mod partitions;
pub mod store;
pub mod task;

pub use error::{LedgerError, Result};
pub use store::{FjallTaskStore, StoreStats, TaskStore};
pub use task::{MoreInfo, NewTask, Task, TaskStatus, TaskType, TaskUpdate};
