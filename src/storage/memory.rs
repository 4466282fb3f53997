//! In-process tick store

use super::{daily_stats, latest, summarize, MarketTick, StorageError, TickStats, TickStore, TokenSummary};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Keeps every tick in memory; used for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    ticks: RwLock<Vec<MarketTick>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored ticks
    pub async fn len(&self) -> usize {
        self.ticks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ticks.read().await.is_empty()
    }

    /// Copy of everything stored, in insertion order
    pub async fn snapshot(&self) -> Vec<MarketTick> {
        self.ticks.read().await.clone()
    }
}

#[async_trait]
impl TickStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert_batch(&self, ticks: &[MarketTick]) -> Result<(), StorageError> {
        self.ticks.write().await.extend_from_slice(ticks);
        Ok(())
    }

    async fn query_last(&self, symbol: &str) -> Result<MarketTick, StorageError> {
        latest(self.ticks.read().await.iter(), symbol)
    }

    async fn query_aggregates(&self, symbol: &str) -> Result<TickStats, StorageError> {
        daily_stats(self.ticks.read().await.iter(), symbol)
    }

    async fn query_summary(&self, symbols: &[String]) -> Result<Vec<TokenSummary>, StorageError> {
        Ok(summarize(self.ticks.read().await.iter(), symbols))
    }
}
