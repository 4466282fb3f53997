//! Pipeline wiring
//!
//! Builds the guarded store, worker pool and optional batch writer, then runs
//! login, connect, subscribe and stream under the supervisor until shutdown.

use crate::auth::{AuthError, Authenticator, Session};
use crate::config::{Config, StorageBackend, StorageConfig, WriteMode};
use crate::pipeline::{BatchWriter, RecordSink, TickHandler, WorkerPool};
use crate::resilience::CircuitBreaker;
use crate::storage::{GuardedStore, MarketTick, MemoryStore, ParquetStore, StorageError, TickStats, TickStore};
use crate::supervisor::{Supervisor, SupervisorError};
use crate::telemetry::PipelineMetrics;
use crate::ws::{MessageHandler, StreamClient, Transport, WsConfig, WsError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Why one supervised session ended
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("stream failed: {0}")]
    Stream(#[from] WsError),
}

/// Open the configured storage backend
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn TickStore>, StorageError> {
    match config.backend {
        StorageBackend::Parquet => {
            let store = ParquetStore::open_with(&config.output_dir, config.parquet_config())?;
            tracing::info!(dir = %config.output_dir.display(), "Using Parquet tick store");
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            tracing::info!("Using in-memory tick store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Last stored tick and daily aggregates for one token
#[derive(Debug, Clone)]
pub struct Verification {
    pub last: MarketTick,
    pub stats: TickStats,
}

pub async fn verify_token(store: &dyn TickStore, token: &str) -> Result<Verification, StorageError> {
    let last = store.query_last(token).await?;
    let stats = store.query_aggregates(token).await?;
    Ok(Verification { last, stats })
}

/// Owns everything one pipeline run needs
pub struct Ingestor {
    config: Config,
    authenticator: Arc<dyn Authenticator>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn TickStore>,
    metrics: Arc<PipelineMetrics>,
    breaker: Arc<CircuitBreaker>,
    client_code: String,
    api_key: String,
}

impl Ingestor {
    pub fn new(
        config: Config,
        authenticator: Arc<dyn Authenticator>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn TickStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.breaker_config("storage")));
        Self {
            config,
            authenticator,
            transport,
            store,
            metrics,
            breaker,
            client_code: String::new(),
            api_key: String::new(),
        }
    }

    /// Account identity sent with the stream upgrade request
    pub fn with_client(mut self, client_code: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.client_code = client_code.into();
        self.api_key = api_key.into();
        self
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Breaker guarding the store
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Stream settings carrying the session's auth headers
    pub fn ws_config(&self, session: &Session) -> WsConfig {
        self.config
            .feed
            .ws_config()
            .header("Authorization", format!("Bearer {}", session.jwt_token))
            .header("X-Client-Code", &self.client_code)
            .header("X-Api-Key", &self.api_key)
            .header("X-Feed-Token", &session.feed_token)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
    }

    /// Run until shutdown, or until the supervisor gives up
    ///
    /// Queued ticks are drained and the batch buffer flushed before returning.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        let pipeline = &self.config.pipeline;
        let breaker = self.breaker.clone();
        let guarded: Arc<dyn TickStore> = Arc::new(GuardedStore::new(
            self.store.clone(),
            breaker.clone(),
            self.config.storage.query_timeout(),
        ));

        let (sink, writer) = match pipeline.write_mode {
            WriteMode::Single => (RecordSink::Direct(guarded.clone()), None),
            WriteMode::Batch => {
                let (handle, task) =
                    BatchWriter::spawn(pipeline.batch_config(), guarded.clone(), self.metrics.clone());
                (RecordSink::Batched(handle), Some(task))
            }
        };

        let (pool, queue) = WorkerPool::start(
            pipeline.num_workers,
            pipeline.buffer_size,
            sink,
            self.metrics.clone(),
            shutdown.clone(),
        );
        let handler: Arc<dyn MessageHandler> = Arc::new(TickHandler::new(queue, self.metrics.clone()));

        let verifier = match (pipeline.verify_interval_secs, self.config.feed.tokens().first()) {
            (0, _) | (_, None) => None,
            (secs, Some(token)) => Some(tokio::spawn(verify_loop(
                guarded.clone(),
                breaker.clone(),
                self.metrics.clone(),
                token.clone(),
                Duration::from_secs(secs),
                shutdown.clone(),
            ))),
        };

        tracing::info!(
            url = %self.config.feed.url,
            workers = pool.size(),
            write_mode = ?pipeline.write_mode,
            store = self.store.name(),
            "Starting ingestion"
        );

        let mut supervisor = Supervisor::new(self.config.supervisor.backoff_config(), shutdown.clone());
        let this = &self;
        let result = supervisor
            .run(move |attempt| {
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                async move {
                    tracing::debug!(attempt, "Opening feed session");
                    this.session(handler, shutdown).await
                }
            })
            .await;

        // the handler (and with it the job queue) is gone; workers drain and exit
        pool.join().await;
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::error!(error = %e, "Batch writer task failed");
            }
        }
        if let Some(verifier) = verifier {
            verifier.abort();
        }
        // last write goes straight to the store, open circuit or not
        match tokio::time::timeout(self.config.storage.query_timeout(), self.store.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Failed to flush tick store"),
            Err(_) => tracing::error!("Timed out flushing tick store"),
        }

        let snap = self.metrics.snapshot();
        tracing::info!(
            processed = snap.processed,
            errors = snap.errors,
            dropped = snap.dropped,
            decode_errors = snap.decode_errors,
            uptime_secs = snap.uptime_secs,
            "Ingestion stopped"
        );
        result
    }

    async fn session(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        let session = self.authenticator.authenticate().await?;

        let mut client = StreamClient::new(self.ws_config(&session), self.transport.clone(), handler)
            .with_metrics(self.metrics.clone());
        client.connect().await?;

        let request = self.config.feed.subscription_request();
        if let Err(e) = client.send_subscription(&request).await {
            client.close().await;
            return Err(e.into());
        }

        let result = client.run(shutdown).await;
        client.close().await;
        result.map_err(SessionError::from)
    }
}

async fn verify_loop(
    store: Arc<dyn TickStore>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<PipelineMetrics>,
    token: String,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Ok(_) = shutdown.wait_for(|stop| *stop) => break,
        }

        match verify_token(store.as_ref(), &token).await {
            Ok(v) => tracing::info!(
                token = %v.last.symbol,
                at = %v.last.timestamp.format("%H:%M:%S"),
                price = %v.last.last_price,
                day_low = %v.stats.day_low,
                day_high = %v.stats.day_high,
                volume = v.stats.total_volume,
                ticks = v.stats.tick_count,
                "Last stored tick verified"
            ),
            Err(e) => tracing::warn!(token = %token, error = %e, "Verification failed"),
        }

        let snap = metrics.snapshot();
        tracing::info!(
            processed = snap.processed,
            errors = snap.errors,
            dropped = snap.dropped,
            backlog_evicted = snap.backlog_evicted,
            circuit = %breaker.state(),
            uptime_secs = snap.uptime_secs,
            "Pipeline status"
        );
    }
}
