//! Operator status endpoint

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::observability::{Metrics, MetricsSnapshot};
use crate::queue::{DurableQueue, QueueStats};

#[derive(Clone)]
pub struct StatusState {
    pub metrics: Arc<Metrics>,
    pub queue: Arc<DurableQueue>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub metrics: MetricsSnapshot,
    pub queue: QueueStats,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Serve until `shutdown` flips
pub async fn serve(
    address: SocketAddr,
    state: StatusState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!(%address, "Status endpoint listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn stats(State(state): State<StatusState>) -> Response {
    match state.queue.stats() {
        Ok(queue) => Json(StatusReport {
            metrics: state.metrics.snapshot(),
            queue,
        })
        .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to read queue stats");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
