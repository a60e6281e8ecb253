//! HTTP server for the Prometheus metrics and status endpoints.

use crate::metrics::MetricsRegistry;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use devicehealth::MonitorHandle;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared handler state
#[derive(Clone)]
struct AppState {
    registry: Arc<MetricsRegistry>,
    monitor: MonitorHandle,
}

/// HTTP server for metrics and status
pub struct MetricsServer {
    state: AppState,
    /// Listen address
    listen_addr: String,
}

impl MetricsServer {
    /// Create a new metrics server
    pub fn new(registry: Arc<MetricsRegistry>, monitor: MonitorHandle, listen_addr: String) -> Self {
        Self {
            state: AppState { registry, monitor },
            listen_addr,
        }
    }

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/status", get(status_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(state)
    }

    /// Run the HTTP server
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(listen_addr = %listener.local_addr()?, "Metrics server listening");
        axum::serve(listener, Self::router(self.state)).await?;
        Ok(())
    }
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.registry.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Handler for /status endpoint: one snapshot per worker, in registration order
async fn status_handler(State(state): State<AppState>) -> Response {
    match state.monitor.statuses().await {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to query worker status");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}
