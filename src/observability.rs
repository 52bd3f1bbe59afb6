//! Metrics counters and tracing setup

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise everything at `info` and above is logged.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Process-wide counters, shared behind an `Arc`
#[derive(Debug, Default)]
pub struct Metrics {
    tasks_queued: AtomicU64,
    enqueue_failures: AtomicU64,
    tasks_started: AtomicU64,
    tasks_finished: AtomicU64,
    tasks_faulty: AtomicU64,
    throttle_waits: AtomicU64,
    proxy_fallbacks: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_queued(&self) {
        self.tasks_queued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "tasks_queued", "Metric incremented");
    }

    pub fn enqueue_failed(&self) {
        self.enqueue_failures.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "enqueue_failures", "Metric incremented");
    }

    pub fn task_started(&self) {
        self.tasks_started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "tasks_started", "Metric incremented");
    }

    pub fn task_finished(&self) {
        self.tasks_finished.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "tasks_finished", "Metric incremented");
    }

    pub fn task_faulty(&self) {
        self.tasks_faulty.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "tasks_faulty", "Metric incremented");
    }

    pub fn throttled(&self) {
        self.throttle_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn proxy_fallback(&self) {
        self.proxy_fallbacks.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "proxy_fallbacks", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_queued: self.tasks_queued.load(Ordering::Relaxed),
            enqueue_failures: self.enqueue_failures.load(Ordering::Relaxed),
            tasks_started: self.tasks_started.load(Ordering::Relaxed),
            tasks_finished: self.tasks_finished.load(Ordering::Relaxed),
            tasks_faulty: self.tasks_faulty.load(Ordering::Relaxed),
            throttle_waits: self.throttle_waits.load(Ordering::Relaxed),
            proxy_fallbacks: self.proxy_fallbacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_queued: u64,
    pub enqueue_failures: u64,
    pub tasks_started: u64,
    pub tasks_finished: u64,
    pub tasks_faulty: u64,
    pub throttle_waits: u64,
    pub proxy_fallbacks: u64,
}
