//! tick-ingest: resilient market-data feed ingestion
//!
//! This library provides the core components for:
//! - Decoding the binary tick feed
//! - A reconnecting, heartbeating WebSocket stream client
//! - A bounded worker pool with drop-newest backpressure
//! - Batched, circuit-breaker-guarded writes to a columnar tick store
//! - A supervisor that restarts the session with exponential backoff
//! - Logging and Prometheus metrics

pub mod auth;
pub mod cli;
pub mod config;
pub mod decoder;
pub mod feed;
pub mod ingest;
pub mod pipeline;
pub mod resilience;
pub mod storage;
pub mod supervisor;
pub mod telemetry;
pub mod ws;
