use std::error::Error as StdError;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::crawler::{CrawlContext, CrawlerRegistry, Services};
use crate::ledger::{LedgerError, TaskStatus, TaskUpdate};
use crate::queue::{DurableQueue, Lease, QueueError};

/// What happened to one leased item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Faulty,
    /// Redelivered item whose task already reached a terminal state
    Skipped,
}

/// Render an error and all of its sources, outermost first
pub fn error_chain(error: &dyn StdError) -> String {
    let mut details = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        details.push_str("\ncaused by: ");
        details.push_str(&cause.to_string());
        source = cause.source();
    }
    details
}

/// Leases items from the queue and runs their crawlers
///
/// Only queue failures are returned to the caller. Everything that goes wrong
/// with the task itself ends up in the task record.
pub struct Consumer {
    queue: Arc<DurableQueue>,
    registry: Arc<CrawlerRegistry>,
    services: Services,
}

impl Consumer {
    pub fn new(
        queue: Arc<DurableQueue>,
        registry: Arc<CrawlerRegistry>,
        services: Services,
    ) -> Self {
        Self {
            queue,
            registry,
            services,
        }
    }

    /// Process the oldest ready item; `None` when the queue is empty
    pub async fn consume_one(&self) -> Result<Option<Outcome>, QueueError> {
        match self.queue.get()? {
            Some(lease) => self.process_lease(lease).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process items until the queue is empty
    pub async fn drain(&self) -> Result<usize, QueueError> {
        let mut processed = 0;
        while self.consume_one().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    pub async fn process_lease(&self, lease: Lease) -> Result<Outcome, QueueError> {
        let task_id = lease.item.options.task_id;
        let crawler_name = lease.item.options.crawler.clone();
        let store = &self.services.store;

        let task = match store.get(&task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(%task_id, seq = lease.seq, "Leased item references an unknown task");
                self.queue.ack_failed(&lease, format!("task {task_id} not found"))?;
                return Ok(Outcome::Faulty);
            }
            Err(e) => {
                error!(%task_id, error = %e, "Failed to load task");
                self.queue.ack_failed(&lease, error_chain(&e))?;
                return Ok(Outcome::Faulty);
            }
        };

        if task.status.is_terminal() {
            info!(
                %task_id,
                status = %task.status,
                "Task already settled, dropping redelivered item"
            );
            self.queue.ack(&lease)?;
            return Ok(Outcome::Skipped);
        }

        if let Err(e) = self.start(&task_id, task.status) {
            return self.fail(&lease, &crawler_name, error_chain(&e));
        }
        self.services.metrics.task_started();

        let crawler = match self.registry.get(&crawler_name) {
            Ok(crawler) => crawler,
            Err(e) => return self.fail(&lease, &crawler_name, e.to_string()),
        };

        info!(%task_id, crawler = %crawler_name, seq = lease.seq, "Crawl started");

        let ctx = CrawlContext::new(task_id, crawler_name.clone(), self.services.clone());
        let params = lease.item.params.clone();
        let options = lease.item.options.clone();
        let handle =
            tokio::spawn(async move { crawler.crawl(&ctx, &params, &options).await });

        match handle.await {
            Ok(Ok(())) => self.finish(&lease),
            Ok(Err(e)) => self.fail(&lease, &crawler_name, error_chain(&e)),
            Err(e) => self.fail(&lease, &crawler_name, format!("crawler aborted: {e}")),
        }
    }

    fn start(&self, task_id: &uuid::Uuid, status: TaskStatus) -> Result<(), LedgerError> {
        let store = &self.services.store;

        // The poller enqueues before it records QUEUED
        if status == TaskStatus::Created {
            store.update(task_id, TaskUpdate::status(TaskStatus::Queued))?;
        }

        let update = TaskUpdate::builder()
            .status(TaskStatus::InProgress)
            .count_performance(true)
            .build();
        store.update(task_id, update)?;
        Ok(())
    }

    fn finish(&self, lease: &Lease) -> Result<Outcome, QueueError> {
        let task_id = lease.item.options.task_id;
        self.queue.ack(lease)?;

        match self
            .services
            .store
            .update(&task_id, TaskUpdate::status(TaskStatus::Finished))
        {
            Ok(_) => {
                self.services.metrics.task_finished();
                info!(%task_id, "Crawl finished");
                Ok(Outcome::Finished)
            }
            Err(LedgerError::InvalidTransition { from, .. }) => {
                warn!(%task_id, status = %from, "Crawler settled the task itself");
                Ok(if from == TaskStatus::Faulty {
                    Outcome::Faulty
                } else {
                    Outcome::Finished
                })
            }
            Err(e) => {
                error!(%task_id, error = %e, "Failed to mark task finished");
                Ok(Outcome::Finished)
            }
        }
    }

    fn fail(&self, lease: &Lease, crawler: &str, details: String) -> Result<Outcome, QueueError> {
        let task_id = lease.item.options.task_id;
        warn!(%task_id, crawler, %details, "Crawl failed");

        self.queue.ack_failed(lease, details.clone())?;
        self.services.metrics.task_faulty();

        if let Err(e) = self
            .services
            .store
            .update(&task_id, TaskUpdate::failed(crawler, details))
        {
            error!(%task_id, error = %e, "Failed to mark task faulty");
        }

        debug!(%task_id, seq = lease.seq, "Item moved to failed partition");
        Ok(Outcome::Faulty)
    }
}
