//! HTTP endpoint serving `/metrics` for Prometheus scraping.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::prometheus::metrics_handler;

/// Errors from metrics setup and serving.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Metric registration failed: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("Invalid metrics address '{0}'")]
    InvalidAddress(String),

    #[error("Metrics server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a listen address; a bare `:port` listens on all interfaces.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, MetricsError> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|_| MetricsError::InvalidAddress(addr.to_string()))
}

/// Router exposing `GET /metrics`.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serves `/metrics` on `addr` until `shutdown` fires.
pub async fn serve_metrics(addr: &str, shutdown: CancellationToken) -> Result<(), MetricsError> {
    let addr = parse_listen_addr(addr)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Serving Prometheus metrics");

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
