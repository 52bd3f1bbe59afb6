use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ledger::{Result, Task, TaskStatus, TaskStore, TaskUpdate};
use crate::observability::Metrics;
use crate::queue::{CrawlOptions, Producer};

/// `more_info` source for enqueue failures
pub const POLLER_SOURCE: &str = "poller";

/// Outcome of one poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub found: usize,
    pub queued: usize,
    pub failed: usize,
}

/// Moves CREATED tasks into the queue
pub struct TaskPoller {
    store: Arc<dyn TaskStore>,
    producer: Arc<dyn Producer>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    interval: Duration,
}

impl TaskPoller {
    pub fn new(
        store: Arc<dyn TaskStore>,
        producer: Arc<dyn Producer>,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let interval = config.engine.poll_interval.as_duration();
        Self {
            store,
            producer,
            config,
            metrics,
            interval,
        }
    }

    /// Global defaults, then crawler defaults, then the task's own options
    ///
    /// The execution date is stamped fresh on every call.
    pub fn merged_options(&self, task: &Task) -> CrawlOptions {
        let mut settings = Map::new();
        settings.extend(self.config.defaults.clone());
        settings.extend(self.config.crawler_options(&task.kind));
        settings.extend(task.options.clone());

        CrawlOptions::new(&task.kind, task.task_id).with_settings(settings)
    }

    /// Enqueue every CREATED task; each one leaves as QUEUED or FAULTY
    pub async fn poll_once(&self) -> Result<PollStats> {
        let created = self.store.filter_by_status(TaskStatus::Created)?;
        let mut stats = PollStats {
            found: created.len(),
            ..Default::default()
        };

        for task in created {
            let options = self.merged_options(&task);

            let enqueued = self
                .producer
                .add_crawl_params(task.params.clone(), options)
                .await;

            let update = match enqueued {
                Ok(()) => {
                    self.metrics.task_queued();
                    stats.queued += 1;
                    TaskUpdate::status(TaskStatus::Queued)
                }
                Err(e) => {
                    error!(task_id = %task.task_id, error = %e, "Failed to enqueue task");
                    self.metrics.enqueue_failed();
                    stats.failed += 1;
                    TaskUpdate::failed(POLLER_SOURCE, format!("enqueue failed: {e}"))
                }
            };

            if let Err(e) = self.store.update(&task.task_id, update) {
                warn!(task_id = %task.task_id, error = %e, "Failed to record poll outcome");
            }
        }

        if stats.found > 0 {
            info!(
                found = stats.found,
                queued = stats.queued,
                failed = stats.failed,
                "Poll cycle"
            );
        } else {
            debug!("Poll cycle found no new tasks");
        }
        Ok(stats)
    }

    /// Poll on a fixed interval until `shutdown` flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval = ?self.interval, "Task poller started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Poll cycle failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Task poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{FjallTaskStore, NewTask};
    use crate::queue::{ChannelProducer, MemoryProducer};
    use serde_json::{Value, json};
    use tempfile::TempDir;

    fn config() -> Config {
        let toml = r#"
[defaults]
depth = 1
lang = "en"

[crawlers.companies.options]
depth = 2
region = "eu"
        "#;
        toml::from_str(toml).unwrap()
    }

    fn options(pairs: Value) -> Map<String, Value> {
        pairs.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_options_precedence() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FjallTaskStore::open(temp_dir.path()).unwrap());
        let producer = Arc::new(MemoryProducer::new());
        let poller = TaskPoller::new(
            store.clone(),
            producer.clone(),
            Arc::new(config()),
            Arc::new(Metrics::new()),
        );

        let task = store
            .create(
                NewTask::builder()
                    .kind("companies")
                    .params(json!({"id": 1}))
                    .options(options(json!({"region": "us", "crawler": "evil"})))
                    .build(),
            )
            .unwrap();

        let stats = poller.poll_once().await.unwrap();
        assert_eq!(stats, PollStats { found: 1, queued: 1, failed: 0 });

        let items = producer.drain().await;
        let merged = &items[0].options;
        assert_eq!(merged.crawler, "companies");
        assert_eq!(merged.task_id, task.task_id);
        assert_eq!(merged.get("lang"), Some(&json!("en")));
        assert_eq!(merged.get("depth"), Some(&json!(2)));
        assert_eq!(merged.get("region"), Some(&json!("us")));
        assert!(merged.get("crawler").is_none());

        let stored = store.get(&task.task_id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_enqueue_failure_marks_faulty() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FjallTaskStore::open(temp_dir.path()).unwrap());
        let (producer, rx) = ChannelProducer::new(1);
        drop(rx);
        let metrics = Arc::new(Metrics::new());
        let poller = TaskPoller::new(
            store.clone(),
            Arc::new(producer),
            Arc::new(Config::default()),
            metrics.clone(),
        );

        let task = store.create(NewTask::builder().kind("fetch").build()).unwrap();
        let stats = poller.poll_once().await.unwrap();
        assert_eq!(stats.failed, 1);

        let stored = store.get(&task.task_id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Faulty);
        assert_eq!(stored.more_info[0].source, POLLER_SOURCE);
        assert_eq!(metrics.snapshot().enqueue_failures, 1);
    }

    #[tokio::test]
    async fn test_only_created_tasks_are_picked() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FjallTaskStore::open(temp_dir.path()).unwrap());
        let producer = Arc::new(MemoryProducer::new());
        let poller = TaskPoller::new(
            store.clone(),
            producer.clone(),
            Arc::new(Config::default()),
            Arc::new(Metrics::new()),
        );

        for _ in 0..3 {
            store.create(NewTask::builder().kind("fetch").build()).unwrap();
        }
        assert_eq!(poller.poll_once().await.unwrap().queued, 3);
        assert_eq!(poller.poll_once().await.unwrap(), PollStats::default());
        assert_eq!(producer.len().await, 3);
    }
}
