//! Health and metrics HTTP endpoints
//!
//! `/health` reports pipeline status as JSON; it answers 503 while the storage
//! circuit is not closed. `/metrics` renders the Prometheus exposition.

use crate::resilience::{CircuitBreaker, CircuitState};
use crate::telemetry::PipelineMetrics;
use crate::ws::ConnectionState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" or "degraded"
    pub status: &'static str,
    pub start_time: DateTime<Utc>,
    pub uptime_secs: u64,
    pub circuit: String,
    pub connection: String,
    pub processed: u64,
    pub errors: u64,
    pub dropped: u64,
    pub decode_errors: u64,
    pub last_processed: Option<DateTime<Utc>>,
    /// "healthy" or "unhealthy" per component
    pub components: BTreeMap<&'static str, &'static str>,
}

/// Shared state for the endpoints
#[derive(Clone)]
pub struct HealthState {
    metrics: Arc<PipelineMetrics>,
    breaker: Arc<CircuitBreaker>,
    prometheus: Option<PrometheusHandle>,
    started_at: DateTime<Utc>,
}

impl HealthState {
    pub fn new(metrics: Arc<PipelineMetrics>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            metrics,
            breaker,
            prometheus: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    fn report(&self) -> HealthResponse {
        let snap = self.metrics.snapshot();
        let circuit = self.breaker.state();
        let connection = self.metrics.connection_state();

        let health = |ok: bool| if ok { "healthy" } else { "unhealthy" };
        let storage_ok = circuit == CircuitState::Closed;
        let components = BTreeMap::from([
            ("storage", health(storage_ok)),
            ("feed", health(connection == ConnectionState::Connected)),
        ]);

        HealthResponse {
            status: if storage_ok { "ok" } else { "degraded" },
            start_time: self.started_at,
            uptime_secs: snap.uptime_secs,
            circuit: circuit.to_string(),
            connection: connection.to_string(),
            processed: snap.processed,
            errors: snap.errors,
            dropped: snap.dropped,
            decode_errors: snap.decode_errors,
            last_processed: snap.last_processed,
            components,
        }
    }
}

async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let report = state.report();
    let code = if report.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn metrics(State(state): State<HealthState>) -> (StatusCode, String) {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed\n".to_string()),
    }
}

/// Create the router
pub fn create_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until shutdown
pub async fn run_server(
    listener: TcpListener,
    state: HealthState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let upkeep = state.prometheus.clone().map(|handle| {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(UPKEEP_INTERVAL);
            loop {
                ticker.tick().await;
                handle.run_upkeep();
            }
        })
    });

    let app = create_router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await;

    if let Some(upkeep) = upkeep {
        upkeep.abort();
    }
    result
}

/// Bind `addr` and serve in the background
pub async fn spawn_server(
    addr: SocketAddr,
    state: HealthState,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = run_server(listener, state, shutdown).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });
    tracing::info!(addr = %bound, "Health and metrics endpoint listening");
    Ok(bound)
}
