// src/server/metrics_server.rs

use crate::core::metrics::gather_metrics;
use crate::core::state::BridgeState;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint.
///
/// Updates the dynamic gauges before gathering all registered metrics and
/// encoding them in the Prometheus text format.
async fn metrics_handler(state: Arc<BridgeState>) -> impl IntoResponse {
    crate::core::metrics::ACTIVE_JOBS.set(state.stats.active_job_count() as f64);
    {
        let registry = state.registry.read().await;
        for (status, count) in registry.status_counts() {
            let label = status.to_string();
            crate::core::metrics::REGISTRY_ENTRIES
                .with_label_values(&[label.as_str()])
                .set(count as f64);
        }
    }

    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Serves the /metrics endpoint until shutdown. A bind failure only costs
/// observability, so it is logged rather than propagated.
pub async fn run_metrics_server(state: Arc<BridgeState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let port = state.config.lock().await.metrics.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Metrics endpoint cannot bind port {port}: {e}");
            return;
        }
    };
    info!("Metrics exported at http://{addr}/metrics");

    let app = Router::new().route("/metrics", get(move || metrics_handler(state.clone())));
    let until_shutdown = async move {
        let _ = shutdown_rx.recv().await;
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(until_shutdown)
        .await
    {
        error!("Metrics endpoint failed: {e}");
    }
}
