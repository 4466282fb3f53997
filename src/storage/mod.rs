//! Tick storage
//!
//! The [`TickStore`] trait is the only way the pipeline touches persisted
//! data. [`GuardedStore`] wraps any store with the circuit breaker and a
//! per-call timeout.

mod guarded;
mod memory;
mod parquet;

pub use guarded::GuardedStore;
pub use memory::MemoryStore;
pub use self::parquet::{tick_schema, ParquetConfig, ParquetStore};

use crate::decoder::DecodedTick;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// One persisted tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    /// Local receipt time
    pub timestamp: DateTime<Utc>,
    /// Producer-side event time
    pub exchange_timestamp: DateTime<Utc>,
    /// Instrument token
    pub symbol: String,
    pub exchange_type: u8,
    pub sequence_number: i64,
    pub last_price: Decimal,
    pub volume: i64,
    /// Not carried by the feed; always zero
    pub bid_price: Decimal,
    /// Not carried by the feed; always zero
    pub ask_price: Decimal,
    pub open_price: Decimal,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub close_price: Decimal,
}

impl MarketTick {
    /// Build the storage record for a decoded tick received at `received_at`
    ///
    /// A non-positive or out-of-range exchange time is replaced by `received_at`.
    pub fn from_tick(tick: &DecodedTick, received_at: DateTime<Utc>) -> Self {
        let exchange_timestamp = Some(tick.exchange_timestamp)
            .filter(|ms| *ms > 0)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(|| {
                tracing::warn!(
                    token = %tick.token,
                    exchange_timestamp = tick.exchange_timestamp,
                    "Invalid exchange timestamp, using receipt time"
                );
                received_at
            });

        Self {
            timestamp: received_at,
            exchange_timestamp,
            symbol: tick.token.clone(),
            exchange_type: tick.exchange_type.as_u8(),
            sequence_number: tick.sequence_number,
            last_price: tick.last_price(),
            volume: tick.quote.volume_traded_for_day,
            bid_price: Decimal::ZERO,
            ask_price: Decimal::ZERO,
            open_price: tick.open_price(),
            high_price: tick.high_price(),
            low_price: tick.low_price(),
            close_price: tick.close_price(),
        }
    }
}

/// Aggregates over the most recent trading day of one token
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickStats {
    pub symbol: String,
    pub date: NaiveDate,
    pub day_low: Decimal,
    pub day_high: Decimal,
    pub total_volume: i64,
    pub tick_count: u64,
}

/// Freshness of one token
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenSummary {
    pub symbol: String,
    pub last_update: DateTime<Utc>,
    pub tick_count: u64,
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no ticks stored for {0}")]
    NotFound(String),

    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("circuit breaker open, storage call rejected")]
    CircuitOpen,

    #[error("circuit breaker half-open, trial request limit reached")]
    HalfOpenLimit,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ::parquet::errors::ParquetError),

    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether this error says something about the store's health
    ///
    /// A missing row is a valid answer, not an outage.
    pub fn is_failure(&self) -> bool {
        !matches!(self, StorageError::NotFound(_))
    }
}

/// Columnar tick store
#[async_trait]
pub trait TickStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    async fn insert_one(&self, tick: &MarketTick) -> Result<(), StorageError> {
        self.insert_batch(std::slice::from_ref(tick)).await
    }

    /// Insert all ticks as one unit
    async fn insert_batch(&self, ticks: &[MarketTick]) -> Result<(), StorageError>;

    /// Persist anything the backend is still holding in memory
    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Most recently received tick for a token
    async fn query_last(&self, symbol: &str) -> Result<MarketTick, StorageError>;

    /// Aggregates for the latest day a token has data for
    async fn query_aggregates(&self, symbol: &str) -> Result<TickStats, StorageError>;

    /// Last update and tick count for each listed token that has data
    async fn query_summary(&self, symbols: &[String]) -> Result<Vec<TokenSummary>, StorageError>;
}

pub(crate) fn latest<'a>(
    ticks: impl IntoIterator<Item = &'a MarketTick>,
    symbol: &str,
) -> Result<MarketTick, StorageError> {
    ticks
        .into_iter()
        .filter(|t| t.symbol == symbol)
        .max_by_key(|t| (t.timestamp, t.sequence_number))
        .cloned()
        .ok_or_else(|| StorageError::NotFound(symbol.to_string()))
}

pub(crate) fn daily_stats<'a>(
    ticks: impl IntoIterator<Item = &'a MarketTick>,
    symbol: &str,
) -> Result<TickStats, StorageError> {
    let mut by_day: HashMap<NaiveDate, Vec<&MarketTick>> = HashMap::new();
    for tick in ticks.into_iter().filter(|t| t.symbol == symbol) {
        by_day.entry(tick.timestamp.date_naive()).or_default().push(tick);
    }

    let (date, day) = by_day
        .into_iter()
        .max_by_key(|(date, _)| *date)
        .ok_or_else(|| StorageError::NotFound(symbol.to_string()))?;

    let day_low = day.iter().map(|t| t.low_price).min().unwrap_or_default();
    let day_high = day.iter().map(|t| t.high_price).max().unwrap_or_default();

    Ok(TickStats {
        symbol: symbol.to_string(),
        date,
        day_low,
        day_high,
        total_volume: day.iter().map(|t| t.volume).sum(),
        tick_count: day.len() as u64,
    })
}

pub(crate) fn summarize<'a>(
    ticks: impl IntoIterator<Item = &'a MarketTick>,
    symbols: &[String],
) -> Vec<TokenSummary> {
    let mut acc: HashMap<&str, (DateTime<Utc>, u64)> = HashMap::new();
    for tick in ticks {
        if !symbols.iter().any(|s| *s == tick.symbol) {
            continue;
        }
        let entry = acc
            .entry(tick.symbol.as_str())
            .or_insert((tick.timestamp, 0));
        entry.0 = entry.0.max(tick.timestamp);
        entry.1 += 1;
    }

    symbols
        .iter()
        .filter_map(|s| {
            acc.get(s.as_str()).map(|(last_update, tick_count)| TokenSummary {
                symbol: s.clone(),
                last_update: *last_update,
                tick_count: *tick_count,
            })
        })
        .collect()
}
