//! Producers turn (params, options) pairs into queued work
//!
//! The poller and crawlers only see the [`Producer`] trait. Behind it sit the
//! durable queue, an in-process channel, the task ledger (batch seeding) and a
//! plain list for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::item::{CrawlOptions, QueueItem};
use super::store::{DurableQueue, QueueError};
use crate::ledger::{LedgerError, NewTask, TaskStore, TaskType};

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, ProducerError>;

#[async_trait]
pub trait Producer: Send + Sync {
    /// Submit one unit of work
    async fn add_crawl_params(&self, params: Value, options: CrawlOptions) -> Result<()>;
}

/// Writes into the [`DurableQueue`]
pub struct QueueProducer {
    queue: Arc<DurableQueue>,
}

impl QueueProducer {
    pub fn new(queue: Arc<DurableQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Producer for QueueProducer {
    async fn add_crawl_params(&self, params: Value, options: CrawlOptions) -> Result<()> {
        let seq = self.queue.put(&QueueItem::new(params, options))?;
        debug!(seq, "Crawl params queued");
        Ok(())
    }
}

/// Sends items to an in-process consumer over a bounded channel
///
/// A full channel applies backpressure to the caller.
pub struct ChannelProducer {
    tx: mpsc::Sender<QueueItem>,
}

impl ChannelProducer {
    pub fn new(channel_size: usize) -> (Self, mpsc::Receiver<QueueItem>) {
        let (tx, rx) = mpsc::channel(channel_size);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Producer for ChannelProducer {
    async fn add_crawl_params(&self, params: Value, options: CrawlOptions) -> Result<()> {
        self.tx
            .send(QueueItem::new(params, options))
            .await
            .map_err(|_| ProducerError::ChannelClosed)
    }
}

/// Records each submission as a new BATCH task in the ledger
///
/// Used when a crawler seeds its own work. The poller later queues the tasks
/// like any other; the `task_id` and execution date of the submitted options
/// are replaced by the ones the new task gets.
pub struct TaskProducer {
    store: Arc<dyn TaskStore>,
    user: Option<String>,
    created: AtomicUsize,
}

impl TaskProducer {
    pub fn new(store: Arc<dyn TaskStore>, user: Option<String>) -> Self {
        Self {
            store,
            user,
            created: AtomicUsize::new(0),
        }
    }

    /// Tasks created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Producer for TaskProducer {
    async fn add_crawl_params(&self, params: Value, options: CrawlOptions) -> Result<()> {
        let task = self.store.create(
            NewTask::builder()
                .kind(options.crawler)
                .params(params)
                .options(options.settings)
                .task_type(TaskType::Batch)
                .maybe_user(self.user.clone())
                .build(),
        )?;
        self.created.fetch_add(1, Ordering::SeqCst);

        debug!(task_id = %task.task_id, kind = %task.kind, "Batch task created");
        Ok(())
    }
}

/// Collects items in memory
#[derive(Default)]
pub struct MemoryProducer {
    items: Mutex<Vec<QueueItem>>,
}

impl MemoryProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything collected so far
    pub async fn drain(&self) -> Vec<QueueItem> {
        std::mem::take(&mut *self.items.lock().await)
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn add_crawl_params(&self, params: Value, options: CrawlOptions) -> Result<()> {
        self.items.lock().await.push(QueueItem::new(params, options));
        Ok(())
    }
}
