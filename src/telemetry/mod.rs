//! Telemetry module
//!
//! Logging, Prometheus metrics and the health endpoint

mod logging;
mod metrics;
pub mod server;

pub use self::metrics::{describe_metrics, MetricsSnapshot, PipelineMetrics};
pub use logging::{init_logging, LogFormat};
pub use server::{create_router, spawn_server, HealthResponse, HealthState};

use crate::config::TelemetryConfig;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Guard that keeps telemetry alive for the life of the process
pub struct TelemetryGuard {
    /// Address for the health and metrics endpoint, if enabled
    pub metrics_addr: Option<SocketAddr>,
    /// Renders the installed recorder
    pub prometheus: Option<PrometheusHandle>,
}

/// Initialize logging and, when a port is configured, the metrics recorder
///
/// The endpoint itself is served by [`spawn_server`] once the pipeline exists.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryGuard> {
    init_logging(&config.log_level, config.log_format)?;

    if config.metrics_port == 0 {
        tracing::info!("Metrics endpoint disabled");
        return Ok(TelemetryGuard {
            metrics_addr: None,
            prometheus: None,
        });
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics recorder: {}", e))?;
    describe_metrics();

    Ok(TelemetryGuard {
        metrics_addr: Some(SocketAddr::from(([0, 0, 0, 0], config.metrics_port))),
        prometheus: Some(handle),
    })
}
