use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::consumer::Consumer;
use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub workers_num: usize,
    /// Pause after finding the queue empty
    pub idle_sleep: Duration,
    /// Loop budget per worker; `None` runs until stopped
    pub max_iterations: Option<u64>,
}

impl From<&EngineConfig> for PoolSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            workers_num: config.workers_num,
            idle_sleep: config.idle_sleep.as_duration(),
            max_iterations: None,
        }
    }
}

/// Fixed set of workers draining one queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn start(consumer: Arc<Consumer>, settings: PoolSettings) -> Self {
        let (stop, stop_rx) = watch::channel(false);

        let handles = (0..settings.workers_num)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    consumer.clone(),
                    settings,
                    stop_rx.clone(),
                ))
            })
            .collect();

        info!(workers = settings.workers_num, "Worker pool started");
        Self { handles, stop }
    }

    /// Wait until every worker has run out of iterations
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
    }

    /// Signal all workers and wait for them to leave their loops
    ///
    /// A worker in the middle of a crawl finishes it first.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        info!("Waiting for workers to stop");
        self.join().await;
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    consumer: Arc<Consumer>,
    settings: PoolSettings,
    mut stop: watch::Receiver<bool>,
) {
    let mut iterations = 0u64;

    loop {
        if *stop.borrow() {
            break;
        }
        if settings.max_iterations.is_some_and(|max| iterations >= max) {
            break;
        }
        iterations += 1;

        let idle = match consumer.consume_one().await {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                error!(worker, error = %e, "Queue error");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(settings.idle_sleep) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    info!(worker, iterations, "Worker stopped");
}
