//! Prometheus metrics exporter
//!
//! Exposes metrics via HTTP for Prometheus scraping.

use crate::metrics::recorder::init_metrics;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Address the scrape endpoint binds to
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to setup metrics: {0}")]
    SetupFailed(String),
}

/// Install the Prometheus recorder and serve it on `config.listen_addr`.
///
/// Must run inside a tokio runtime. Only the first call installs anything;
/// later calls are no-ops.
pub fn start_metrics_server(config: MetricsConfig) -> Result<(), MetricsError> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(config.listen_addr)
        .build()
        .map_err(|e| MetricsError::SetupFailed(e.to_string()))?;

    let handle = recorder.handle();
    ::metrics::set_global_recorder(recorder)
        .map_err(|e| MetricsError::SetupFailed(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::warn!(error = ?e, "metrics exporter stopped");
        }
    });

    let _ = PROMETHEUS_HANDLE.set(handle);
    init_metrics();
    tracing::info!(addr = %config.listen_addr, "metrics endpoint listening");
    Ok(())
}

/// Render current metrics in Prometheus text format, if installed
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}
