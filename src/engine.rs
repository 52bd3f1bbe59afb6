//! Wires stores, services and background loops together

use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, ConfigError};
use crate::crawler::{CrawlError, CrawlerRegistry, RegistryError, Services};
use crate::ledger::{FjallTaskStore, LedgerError, NewTask, Task, TaskStore};
use crate::net::{FetchError, HttpClient};
use crate::observability::Metrics;
use crate::proxy::{ProxyError, ProxyManager, QualityChecker, TcpProber};
use crate::queue::{CrawlOptions, DurableQueue, QueueError, QueueProducer, TaskProducer};
use crate::server::{self, StatusState};
use crate::throttle::{self, ThrottleError};
use crate::worker::{Consumer, PollStats, PoolSettings, TaskPoller, WorkerPool};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Throttle error: {0}")]
    Throttle(#[from] ThrottleError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("HTTP client error: {0}")]
    Http(#[from] FetchError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Seeding failed: {0}")]
    Seed(#[from] CrawlError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Submitter recorded on tasks a crawler seeds itself
const BATCH_USER: &str = "batch";

/// Everything one crawlbox process runs
pub struct Engine {
    config: Arc<Config>,
    store: Arc<FjallTaskStore>,
    queue: Arc<DurableQueue>,
    registry: Arc<CrawlerRegistry>,
    services: Services,
}

impl Engine {
    pub fn open(config: Config, registry: CrawlerRegistry) -> Result<Self> {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());

        let store = Arc::new(FjallTaskStore::open(&config.storage.ledger_path)?);
        let queue = Arc::new(DurableQueue::open(&config.storage.queue_path)?);

        let provider_client = reqwest::Client::builder()
            .connect_timeout(config.http.connect_timeout.as_duration())
            .timeout(config.http.request_timeout.as_duration())
            .build()
            .map_err(FetchError::from)?;
        let proxies = ProxyManager::from_config(&config.proxy, provider_client)?;
        let http = Arc::new(HttpClient::new(&config.http, proxies, metrics.clone())?);

        let services = Services {
            config: config.clone(),
            store: store.clone(),
            throttle: throttle::build_backend(&config.throttle)?,
            http,
            producer: Arc::new(QueueProducer::new(queue.clone())),
            metrics,
        };

        info!(crawlers = ?registry.names().collect::<Vec<_>>(), "Engine opened");
        Ok(Self {
            config,
            store,
            queue,
            registry: Arc::new(registry),
            services,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<FjallTaskStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.services.metrics
    }

    pub fn status_state(&self) -> StatusState {
        StatusState {
            metrics: self.services.metrics.clone(),
            queue: self.queue.clone(),
        }
    }

    /// Record a new CREATED task for the poller to pick up
    pub fn enqueue(&self, task: NewTask) -> Result<Task> {
        let task = self.store.create(task)?;
        info!(task_id = %task.task_id, kind = %task.kind, "Task created");
        Ok(task)
    }

    /// Let `crawler` seed its own BATCH tasks; returns how many were created
    pub async fn crawl_params(&self, crawler: &str, options: Map<String, Value>) -> Result<usize> {
        let implementation = self.registry.get(crawler)?;
        let producer = TaskProducer::new(self.store.clone(), Some(BATCH_USER.to_string()));
        let options = CrawlOptions::new(crawler, Uuid::nil()).with_settings(options);

        implementation
            .crawl_params(&self.services, &producer, &options)
            .await?;
        self.store.persist()?;

        info!(crawler, created = producer.created(), "Crawler seeded batch tasks");
        Ok(producer.created())
    }

    pub fn poller(&self) -> TaskPoller {
        TaskPoller::new(
            self.store.clone(),
            self.services.producer.clone(),
            self.config.clone(),
            self.services.metrics.clone(),
        )
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(
            self.queue.clone(),
            self.registry.clone(),
            self.services.clone(),
        )
    }

    /// One poll cycle followed by draining the queue on the calling task
    pub async fn run_once(&self) -> Result<PollStats> {
        let stats = self.poller().poll_once().await?;
        let processed = self.consumer().drain().await?;
        info!(queued = stats.queued, processed, "Ran pending work in-process");
        Ok(stats)
    }

    /// Execute one task right away instead of waiting for a running engine
    pub async fn run_now(&self, task_id: &Uuid) -> Result<Task> {
        self.run_once().await?;
        self.flush()?;
        self.store
            .get(task_id)?
            .ok_or(EngineError::Ledger(LedgerError::TaskNotFound(*task_id)))
    }

    pub fn flush(&self) -> Result<()> {
        self.queue.flush()?;
        self.store.persist()?;
        Ok(())
    }

    /// Run poller, workers and optional side services until Ctrl+C / SIGTERM
    pub async fn run(self) -> Result<()> {
        let (stop, stop_rx) = watch::channel(false);
        let mut background: Vec<JoinHandle<()>> = Vec::new();

        let pool = WorkerPool::start(
            Arc::new(self.consumer()),
            PoolSettings::from(&self.config.engine),
        );
        background.push(tokio::spawn(self.poller().run(stop_rx.clone())));

        if let Some(ranked) = self.services.http.proxies().pool() {
            let settings = &self.config.proxy.checker;
            if settings.enabled {
                let prober = Arc::new(TcpProber::new(settings.connect_timeout.as_duration()));
                let checker = QualityChecker::new(ranked.clone(), prober, settings);
                background.push(tokio::spawn(checker.run(stop_rx.clone())));
            } else {
                warn!("Proxy quality checker disabled; selection uses provider order");
            }
        }

        if let Some(address) = self.config.engine.status_addr {
            let state = self.status_state();
            let shutdown = stop_rx.clone();
            background.push(tokio::spawn(async move {
                if let Err(e) = server::serve(address, state, shutdown).await {
                    error!(error = %e, "Status endpoint failed");
                }
            }));
        }

        info!(
            workers = self.config.engine.workers_num,
            poll_interval = %self.config.engine.poll_interval.to_human_readable(),
            "Engine running"
        );
        server::shutdown_signal().await;

        let _ = stop.send(true);
        pool.shutdown().await;
        for handle in background {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }

        self.flush()?;
        info!("Engine stopped");
        Ok(())
    }
}
