//! Circuit breaker around storage calls
//!
//! Closed counts requests per fixed window and trips on a failure ratio. Open
//! rejects every call until the open timeout elapses, then HalfOpen admits a
//! limited number of trial requests. Each state change starts a new generation; results
//! from calls admitted in an older generation are discarded.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    /// Gauge value exported for this state
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half-open",
            CircuitState::Open => "open",
        };
        f.write_str(s)
    }
}

/// Breaker tuning
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Label used in logs and metrics
    pub name: String,
    /// Closed-state counting window (zero = never reset while closed)
    pub window: Duration,
    /// Time spent open before probing
    pub open_timeout: Duration,
    /// Requests needed in a window before the ratio is considered
    pub min_requests: u32,
    /// Failure ratio that trips the breaker
    pub failure_ratio: f64,
    /// Trial requests admitted while half-open, and successes needed to close
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: "storage".to_string(),
            window: Duration::from_secs(10),
            open_timeout: Duration::from_secs(60),
            min_requests: 3,
            failure_ratio: 0.6,
            half_open_max_requests: 3,
        }
    }
}

/// Error returned from a guarded call
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open")]
    Open,

    #[error("circuit breaker is half-open and at its trial request limit")]
    TooManyRequests,

    #[error("{0}")]
    Failed(E),
}

impl<E> BreakerError<E> {
    /// Whether the call was rejected without running the operation
    pub fn is_rejected(&self) -> bool {
        matches!(self, BreakerError::Open | BreakerError::TooManyRequests)
    }

    /// The operation's own error, if it ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Request counters for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// Shared breaker; clone the `Arc` to hand it to workers
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<CircuitState>,
}

impl CircuitBreaker {
    /// A zero `half_open_max_requests` is treated as one
    pub fn new(mut config: BreakerConfig) -> Self {
        config.half_open_max_requests = config.half_open_max_requests.max(1);
        let (state_tx, _) = watch::channel(CircuitState::Closed);
        let expiry = (!config.window.is_zero()).then(|| Instant::now() + config.window);
        metrics::gauge!("tick_ingest_circuit_state", "breaker" => config.name.clone())
            .set(CircuitState::Closed.as_gauge());

        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
            state_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current state, applying any time-based transition that is due
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Counters of the current generation
    pub fn counts(&self) -> Counts {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.counts
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<CircuitState> {
        self.state_tx.subscribe()
    }

    /// Run `op` through the breaker; every error counts as a failure
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(op, |_| true).await
    }

    /// Run `op` through the breaker; `is_failure` decides which errors count
    ///
    /// Errors for which `is_failure` returns false are passed back to the caller
    /// but recorded as successes.
    pub async fn call_filtered<F, Fut, T, E, P>(
        &self,
        op: F,
        is_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let generation = self.before_request()?;
        let mut guard = Pending {
            breaker: self,
            generation,
            settled: false,
        };

        let result = op().await;
        let success = match &result {
            Ok(_) => true,
            Err(e) => !is_failure(e),
        };
        guard.settle(success);

        result.map_err(BreakerError::Failed)
    }

    fn before_request<E>(&self) -> Result<u64, BreakerError<E>> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());

        match inner.state {
            CircuitState::Open => return Err(BreakerError::Open),
            CircuitState::HalfOpen
                if inner.counts.requests >= self.config.half_open_max_requests =>
            {
                return Err(BreakerError::TooManyRequests)
            }
            _ => {}
        }

        inner.counts.on_request();
        Ok(inner.generation)
    }

    fn after_request(&self, generation: u64, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);

        if inner.generation != generation {
            return;
        }

        if success {
            self.on_success(&mut inner, now);
        } else {
            self.on_failure(&mut inner, now);
        }
    }

    fn on_success(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            CircuitState::Closed => inner.counts.on_success(),
            CircuitState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.config.half_open_max_requests {
                    self.set_state(inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if self.ready_to_trip(&inner.counts) {
                    self.set_state(inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.set_state(inner, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.config.min_requests
            && f64::from(counts.total_failures) / f64::from(counts.requests)
                >= self.config.failure_ratio
    }

    /// Apply window expiry (closed) or open timeout (open)
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            CircuitState::Closed => {
                if inner.expiry.is_some_and(|at| at <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if inner.expiry.is_some_and(|at| at <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn set_state(&self, inner: &mut Inner, state: CircuitState, now: Instant) {
        if inner.state == state {
            return;
        }

        let from = inner.state;
        inner.state = state;
        self.new_generation(inner, now);

        match state {
            CircuitState::Open => tracing::warn!(
                breaker = %self.config.name,
                %from,
                to = %state,
                retry_in_secs = self.config.open_timeout.as_secs(),
                "Circuit breaker opened"
            ),
            _ => tracing::info!(
                breaker = %self.config.name,
                %from,
                to = %state,
                "Circuit breaker state changed"
            ),
        }

        metrics::gauge!("tick_ingest_circuit_state", "breaker" => self.config.name.clone())
            .set(state.as_gauge());
        self.state_tx.send_replace(state);
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed => {
                (!self.config.window.is_zero()).then(|| now + self.config.window)
            }
            CircuitState::Open => Some(now + self.config.open_timeout),
            CircuitState::HalfOpen => None,
        };
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

/// Admitted request awaiting its outcome
///
/// A call dropped before completing (cancelled by shutdown or an outer
/// timeout) is settled as a failure so half-open trial slots are not leaked.
struct Pending<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Pending<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        self.breaker.after_request(self.generation, success);
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.after_request(self.generation, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            name: "test".to_string(),
            ..Default::default()
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        cb.call(|| async { Ok::<_, &'static str>(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_passes_calls() {
        let cb = CircuitBreaker::new(test_config());
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts().total_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_three_failures() {
        let cb = CircuitBreaker::new(test_config());

        for _ in 0..2 {
            assert!(matches!(fail(&cb).await, Err(BreakerError::Failed("boom"))));
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratio_below_threshold_stays_closed() {
        let cb = CircuitBreaker::new(test_config());

        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        // 2 of 4 = 0.5
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb).await.unwrap_err();
        // 3 of 5 = 0.6
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_counts() {
        let cb = CircuitBreaker::new(test_config());

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(cb.counts(), Counts::default());
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_half_open_limit_still_admits_one_request() {
        let cb = CircuitBreaker::new(BreakerConfig {
            half_open_max_requests: 0,
            ..test_config()
        });
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking() {
        let cb = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }

        let mut invoked = false;
        let result = cb
            .call(|| {
                invoked = true;
                async { Ok::<_, &'static str>(()) }
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open)));
        assert!(result.unwrap_err().is_rejected());
        assert!(!invoked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_then_closes() {
        let cb = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(test_config());
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(succeed(&cb).await, Err(BreakerError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_requests() {
        let cb = std::sync::Arc::new(CircuitBreaker::new(test_config()));
        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        let (release_tx, release_rx) = watch::channel(false);
        let mut trials = Vec::new();
        for _ in 0..3 {
            let cb = cb.clone();
            let mut rx = release_rx.clone();
            trials.push(tokio::spawn(async move {
                cb.call(|| async move {
                    let _ = rx.wait_for(|go| *go).await;
                    Ok::<_, &'static str>(())
                })
                .await
            }));
        }
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            succeed(&cb).await,
            Err(BreakerError::TooManyRequests)
        ));

        release_tx.send_replace(true);
        for trial in trials {
            trial.await.unwrap().unwrap();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filtered_errors_do_not_trip() {
        let cb = CircuitBreaker::new(test_config());

        for _ in 0..5 {
            let result = cb
                .call_filtered(|| async { Err::<(), _>("not found") }, |e| *e != "not found")
                .await;
            assert!(matches!(result, Err(BreakerError::Failed("not found"))));
        }

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts().total_successes, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_result_ignored() {
        let cb = std::sync::Arc::new(CircuitBreaker::new(test_config()));

        let (release_tx, release_rx) = watch::channel(false);
        let slow = {
            let cb = cb.clone();
            let mut rx = release_rx.clone();
            tokio::spawn(async move {
                cb.call(|| async move {
                    let _ = rx.wait_for(|go| *go).await;
                    Ok::<_, &'static str>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        // window rolls over while the slow call is in flight
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.counts(), Counts::default());

        release_tx.send_replace(true);
        slow.await.unwrap().unwrap();
        assert_eq!(cb.counts().total_successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_counts_as_failure() {
        let cb = CircuitBreaker::new(test_config());

        for _ in 0..3 {
            let call = cb.call(|| std::future::pending::<Result<(), &'static str>>());
            let _ = tokio::time::timeout(Duration::from_millis(10), call).await;
        }

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_published_on_watch() {
        let cb = CircuitBreaker::new(test_config());
        let mut rx = cb.subscribe();
        assert_eq!(*rx.borrow(), CircuitState::Closed);

        for _ in 0..3 {
            fail(&cb).await.unwrap_err();
        }

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), CircuitState::Open);
    }

    #[test]
    fn test_state_display_and_gauge() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
        assert_eq!(CircuitState::Closed.as_gauge(), 0.0);
        assert_eq!(CircuitState::Open.as_gauge(), 2.0);
    }
}
