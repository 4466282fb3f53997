//! Pipeline metrics
//!
//! Counters are kept as atomics for in-process snapshots and mirrored into the
//! `metrics` facade for the Prometheus exporter.

use crate::ws::ConnectionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

pub const PROCESSED_TOTAL: &str = "tick_ingest_processed_total";
pub const ERRORS_TOTAL: &str = "tick_ingest_errors_total";
pub const DROPPED_TOTAL: &str = "tick_ingest_dropped_total";
pub const DECODE_ERRORS_TOTAL: &str = "tick_ingest_decode_errors_total";
pub const BACKLOG_EVICTED_TOTAL: &str = "tick_ingest_backlog_evicted_total";
pub const FLUSHES_TOTAL: &str = "tick_ingest_flushes_total";
pub const WRITE_DURATION_SECONDS: &str = "tick_ingest_write_duration_seconds";
pub const CIRCUIT_STATE: &str = "tick_ingest_circuit_state";
pub const CONNECTION_STATE: &str = "tick_ingest_connection_state";
pub const UPTIME_SECONDS: &str = "tick_ingest_uptime_seconds";
pub const LAST_PROCESSED_TIMESTAMP: &str = "tick_ingest_last_processed_timestamp";

/// Register help text for every exported series
pub fn describe_metrics() {
    metrics::describe_counter!(PROCESSED_TOTAL, "Ticks written to the store");
    metrics::describe_counter!(ERRORS_TOTAL, "Failed storage writes");
    metrics::describe_counter!(DROPPED_TOTAL, "Ticks dropped because the job queue was full");
    metrics::describe_counter!(DECODE_ERRORS_TOTAL, "Inbound packets that failed to decode");
    metrics::describe_counter!(BACKLOG_EVICTED_TOTAL, "Buffered ticks evicted by the backlog cap");
    metrics::describe_counter!(FLUSHES_TOTAL, "Batch flushes by outcome");
    metrics::describe_histogram!(
        WRITE_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Storage write latency"
    );
    metrics::describe_gauge!(CIRCUIT_STATE, "Circuit breaker state (0 closed, 1 half-open, 2 open)");
    metrics::describe_gauge!(
        CONNECTION_STATE,
        "Feed connection state (0 disconnected, 1 connecting, 2 connected, 3 reconnecting)"
    );
    metrics::describe_gauge!(UPTIME_SECONDS, metrics::Unit::Seconds, "Process uptime");
    metrics::describe_gauge!(
        LAST_PROCESSED_TIMESTAMP,
        "Unix time of the last successful write"
    );
}

/// Shared pipeline counters
#[derive(Debug)]
pub struct PipelineMetrics {
    started_at: Instant,
    processed: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
    backlog_evicted: AtomicU64,
    /// Epoch millis, 0 = never
    last_processed_ms: AtomicI64,
    /// `ConnectionState` gauge value
    connection_state: AtomicU8,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub errors: u64,
    pub dropped: u64,
    pub decode_errors: u64,
    pub backlog_evicted: u64,
    pub last_processed: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            backlog_evicted: AtomicU64::new(0),
            last_processed_ms: AtomicI64::new(0),
            connection_state: AtomicU8::new(0),
        }
    }

    /// Count `n` stored ticks and stamp the last-processed time
    pub fn increment_processed(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
        metrics::counter!(PROCESSED_TOTAL).increment(n);

        let now = Utc::now();
        self.last_processed_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
        metrics::gauge!(LAST_PROCESSED_TIMESTAMP).set(now.timestamp() as f64);
    }

    pub fn increment_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(ERRORS_TOTAL).increment(1);
    }

    pub fn increment_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(DROPPED_TOTAL).increment(1);
    }

    pub fn increment_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(DECODE_ERRORS_TOTAL).increment(1);
    }

    pub fn increment_backlog_evicted(&self, n: u64) {
        self.backlog_evicted.fetch_add(n, Ordering::Relaxed);
        metrics::counter!(BACKLOG_EVICTED_TOTAL).increment(n);
    }

    /// Storage write latency
    pub fn record_duration(&self, duration: Duration) {
        metrics::histogram!(WRITE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    pub fn record_flush(&self, success: bool) {
        let outcome = if success { "ok" } else { "error" };
        metrics::counter!(FLUSHES_TOTAL, "outcome" => outcome).increment(1);
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state
            .store(state.as_gauge() as u8, Ordering::Relaxed);
        metrics::gauge!(CONNECTION_STATE).set(state.as_gauge());
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self.connection_state.load(Ordering::Relaxed) {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn last_processed(&self) -> Option<DateTime<Utc>> {
        match self.last_processed_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    /// Copy the counters and refresh the uptime gauge
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.uptime();
        metrics::gauge!(UPTIME_SECONDS).set(uptime.as_secs_f64());

        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            backlog_evicted: self.backlog_evicted.load(Ordering::Relaxed),
            last_processed: self.last_processed(),
            uptime_secs: uptime.as_secs(),
        }
    }
}
