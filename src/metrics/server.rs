//! Prometheus endpoint for a running stage.
//!
//! Stage runs are short, so the endpoint is mostly useful for the local
//! launcher where a whole chain runs inside one process.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{MetricsError, PrometheusInitSnafu};

/// Install the Prometheus recorder and serve `/metrics` and `/health` on `addr`.
pub fn init(addr: SocketAddr) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    tokio::spawn(serve(addr, handle));

    Ok(())
}

async fn serve(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new()
        .route("/metrics", get(render))
        .route("/health", get(|| async { "ok\n" }))
        .layer(Extension(handle));

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics endpoint to {}: {}", addr, e);
            return;
        }
    };

    info!("Serving metrics on http://{}/metrics", addr);
    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics endpoint error: {}", e);
    }
}

async fn render(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}
