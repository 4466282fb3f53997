//! Breaker- and timeout-guarded store

use super::{MarketTick, StorageError, TickStats, TickStore, TokenSummary};
use crate::resilience::{BreakerError, CircuitBreaker};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Routes every call through the circuit breaker with a per-call timeout
///
/// A timeout counts as a breaker failure; `NotFound` does not.
#[derive(Clone)]
pub struct GuardedStore {
    inner: Arc<dyn TickStore>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn TickStore>, breaker: Arc<CircuitBreaker>, timeout: Duration) -> Self {
        Self {
            inner,
            breaker,
            timeout,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn guard<T, Fut>(&self, op: Fut) -> Result<T, StorageError>
    where
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let timeout = self.timeout;
        self.breaker
            .call_filtered(
                || async move {
                    tokio::time::timeout(timeout, op)
                        .await
                        .unwrap_or(Err(StorageError::Timeout(timeout)))
                },
                StorageError::is_failure,
            )
            .await
            .map_err(|e| match e {
                BreakerError::Open => StorageError::CircuitOpen,
                BreakerError::TooManyRequests => StorageError::HalfOpenLimit,
                BreakerError::Failed(e) => e,
            })
    }
}

impl std::fmt::Debug for GuardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedStore")
            .field("inner", &self.inner.name())
            .field("breaker", &self.breaker)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl TickStore for GuardedStore {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn insert_one(&self, tick: &MarketTick) -> Result<(), StorageError> {
        self.guard(self.inner.insert_one(tick)).await
    }

    async fn insert_batch(&self, ticks: &[MarketTick]) -> Result<(), StorageError> {
        self.guard(self.inner.insert_batch(ticks)).await
    }

    async fn flush(&self) -> Result<(), StorageError> {
        self.guard(self.inner.flush()).await
    }

    async fn query_last(&self, symbol: &str) -> Result<MarketTick, StorageError> {
        self.guard(self.inner.query_last(symbol)).await
    }

    async fn query_aggregates(&self, symbol: &str) -> Result<TickStats, StorageError> {
        self.guard(self.inner.query_aggregates(symbol)).await
    }

    async fn query_summary(&self, symbols: &[String]) -> Result<Vec<TokenSummary>, StorageError> {
        self.guard(self.inner.query_summary(symbols)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{BreakerConfig, CircuitState};
    use crate::storage::test_support::tick;
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Store that fails or stalls on demand
    #[derive(Default)]
    struct FlakyStore {
        failing: AtomicBool,
        stall: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TickStore for FlakyStore {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn insert_batch(&self, _ticks: &[MarketTick]) -> Result<(), StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stall.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("connection refused".into()));
            }
            Ok(())
        }

        async fn query_last(&self, symbol: &str) -> Result<MarketTick, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::NotFound(symbol.to_string()))
        }

        async fn query_aggregates(&self, symbol: &str) -> Result<TickStats, StorageError> {
            Err(StorageError::NotFound(symbol.to_string()))
        }

        async fn query_summary(&self, _symbols: &[String]) -> Result<Vec<TokenSummary>, StorageError> {
            Ok(Vec::new())
        }
    }

    fn guarded(inner: Arc<dyn TickStore>) -> GuardedStore {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        GuardedStore::new(inner, breaker, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_passes_through_when_healthy() {
        let memory = Arc::new(MemoryStore::new());
        let store = guarded(memory.clone());

        store.insert_one(&tick("2885", Utc::now(), dec!(1))).await.unwrap();
        assert_eq!(memory.len().await, 1);
        assert_eq!(store.name(), "memory");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_open_breaker_and_short_circuit() {
        let flaky = Arc::new(FlakyStore::default());
        flaky.failing.store(true, Ordering::SeqCst);
        let store = guarded(flaky.clone());
        let t = tick("2885", Utc::now(), dec!(1));

        for _ in 0..3 {
            assert!(matches!(
                store.insert_one(&t).await,
                Err(StorageError::Backend(_))
            ));
        }
        assert_eq!(store.breaker().state(), CircuitState::Open);

        assert!(matches!(
            store.insert_one(&t).await,
            Err(StorageError::CircuitOpen)
        ));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let flaky = Arc::new(FlakyStore::default());
        flaky.stall.store(true, Ordering::SeqCst);
        let store = guarded(flaky);
        let t = tick("2885", Utc::now(), dec!(1));

        let err = store.insert_one(&t).await.unwrap_err();
        assert!(matches!(err, StorageError::Timeout(d) if d == Duration::from_secs(30)));
        assert_eq!(store.breaker().counts().total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_keeps_breaker_closed() {
        let flaky = Arc::new(FlakyStore::default());
        let store = guarded(flaky);

        for _ in 0..5 {
            assert!(matches!(
                store.query_last("2885").await,
                Err(StorageError::NotFound(_))
            ));
        }
        assert_eq!(store.breaker().state(), CircuitState::Closed);
    }
}
