use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::diff::{EntityDiff, make_diff};
use crate::ledger::{
    LedgerError, MoreInfo, NewTask, Result, Task, TaskStatus, TaskStore, TaskUpdate,
};
use crate::net::HttpClient;
use crate::observability::Metrics;
use crate::queue::Producer;
use crate::throttle::{Throttle, ThrottleBackend, ThrottleKey};

/// Shared handles every crawl runs against
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub store: Arc<dyn TaskStore>,
    pub throttle: Arc<dyn ThrottleBackend>,
    pub http: Arc<HttpClient>,
    pub producer: Arc<dyn Producer>,
    pub metrics: Arc<Metrics>,
}

impl Services {
    /// Rate limiter for one operation of `crawler`
    pub fn throttle(&self, crawler: &str, operation: &str) -> Throttle {
        Throttle::new(
            self.throttle.clone(),
            ThrottleKey::new(crawler, operation),
            self.config.throttle_limits(crawler, operation),
            self.metrics.clone(),
        )
    }
}

/// What a crawler sees of the engine while it runs one task
pub struct CrawlContext {
    task_id: Uuid,
    crawler: String,
    services: Services,
}

impl CrawlContext {
    pub fn new(task_id: Uuid, crawler: impl Into<String>, services: Services) -> Self {
        Self {
            task_id,
            crawler: crawler.into(),
            services,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn crawler(&self) -> &str {
        &self.crawler
    }

    pub fn http(&self) -> &HttpClient {
        &self.services.http
    }

    /// Emit follow-up work
    pub fn producer(&self) -> &dyn Producer {
        self.services.producer.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.services.config
    }

    /// Rate limiter for one operation of this crawler
    pub fn throttle(&self, operation: &str) -> Throttle {
        self.services.throttle(&self.crawler, operation)
    }

    pub fn task(&self) -> Result<Task> {
        self.services
            .store
            .get(&self.task_id)?
            .ok_or(LedgerError::TaskNotFound(self.task_id))
    }

    /// Record a failure and mark the task FAULTY
    pub fn error(&self, details: impl Into<String>) -> Result<Task> {
        let details = details.into();
        warn!(
            task_id = %self.task_id,
            crawler = %self.crawler,
            %details,
            "Crawler reported an error"
        );
        self.services
            .store
            .update(&self.task_id, TaskUpdate::failed(&self.crawler, details))
    }

    /// File a new MAINTENANCE task for the same work, leaving this one untouched
    pub fn maintenance_notice(&self, details: impl Into<String>) -> Result<Task> {
        let task = self.task()?;
        let notice = NewTask::builder()
            .kind(task.kind)
            .params(task.params)
            .options(task.options)
            .task_type(task.task_type)
            .maybe_user(task.user)
            .status(TaskStatus::Maintenance)
            .more_info(vec![MoreInfo::new(&self.crawler, details)])
            .build();

        let created = self.services.store.create(notice)?;
        info!(
            task_id = %self.task_id,
            notice_id = %created.task_id,
            "Maintenance notice filed"
        );
        Ok(created)
    }

    /// Diff two versions of an entity and store the result on the task
    pub fn register_differences(&self, previous: &Value, current: &Value) -> Result<EntityDiff> {
        let diff = make_diff(previous, current);
        self.register_precomputed(diff.clone())?;
        Ok(diff)
    }

    pub fn register_precomputed(&self, diff: EntityDiff) -> Result<Task> {
        let update = TaskUpdate::builder().differences(diff).build();
        self.services.store.update(&self.task_id, update)
    }

    pub fn load_snapshot(&self, key: &str) -> Result<Option<Value>> {
        self.services.store.load_snapshot(key)
    }

    pub fn save_snapshot(&self, key: &str, value: &Value) -> Result<()> {
        self.services.store.save_snapshot(key, value)
    }
}
