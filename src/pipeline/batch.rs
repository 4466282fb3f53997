//! Batching writer
//!
//! A single task owns the record buffer; workers reach it only through a
//! bounded command channel. The buffer is flushed to the store when it reaches
//! the batch size or when the flush interval elapses, and once more when every
//! handle has been dropped.

use crate::storage::{MarketTick, TickStore};
use crate::telemetry::PipelineMetrics;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};

/// Configuration for the batch writer
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Records per flush
    pub batch_size: usize,
    /// Maximum time between flushes of a non-empty buffer
    pub flush_interval: Duration,
    /// Buffer cap, in batches, while the store is failing
    pub max_backlog_batches: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval: Duration::from_secs(5),
            max_backlog_batches: 10,
        }
    }
}

/// Shortest flush period the writer will tick at
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

impl BatchConfig {
    /// Flush period, clamped away from zero
    pub fn flush_period(&self) -> Duration {
        self.flush_interval.max(MIN_FLUSH_INTERVAL)
    }

    /// Most records held before the oldest are evicted
    pub fn backlog_cap(&self) -> usize {
        self.batch_size.max(1) * self.max_backlog_batches.max(1)
    }
}

/// Result of one flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Written(usize),
    /// Write failed; the records stay buffered
    Failed { buffered: usize, error: String },
}

/// The writer task has exited
#[derive(Debug, Error)]
#[error("batch writer is not running")]
pub struct BatchClosed;

enum Command {
    Record(MarketTick),
    Flush(oneshot::Sender<FlushOutcome>),
}

/// Cloneable handle to the writer task
#[derive(Debug, Clone)]
pub struct BatchHandle {
    tx: mpsc::Sender<Command>,
}

impl BatchHandle {
    /// Queue a record; waits if the command channel is full
    pub async fn record(&self, tick: MarketTick) -> Result<(), BatchClosed> {
        self.tx
            .send(Command::Record(tick))
            .await
            .map_err(|_| BatchClosed)
    }

    /// Flush now and report the outcome
    pub async fn flush(&self) -> Result<FlushOutcome, BatchClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply_tx))
            .await
            .map_err(|_| BatchClosed)?;
        reply_rx.await.map_err(|_| BatchClosed)
    }
}

/// Bounded FIFO that evicts the oldest records when full
#[derive(Debug)]
struct TickBuffer {
    records: VecDeque<MarketTick>,
    cap: usize,
}

impl TickBuffer {
    fn new(cap: usize) -> Self {
        Self {
            records: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Push a record; returns how many old records were evicted
    fn push(&mut self, tick: MarketTick) -> usize {
        let mut evicted = 0;
        while self.records.len() >= self.cap {
            self.records.pop_front();
            evicted += 1;
        }
        self.records.push_back(tick);
        evicted
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn as_slice(&mut self) -> &[MarketTick] {
        self.records.make_contiguous()
    }

    fn clear(&mut self) {
        self.records.clear();
    }
}

/// Writer task state
pub struct BatchWriter {
    config: BatchConfig,
    store: Arc<dyn TickStore>,
    metrics: Arc<PipelineMetrics>,
    buffer: TickBuffer,
    /// Buffer length that fires the next size-triggered flush
    size_trigger: usize,
}

impl BatchWriter {
    /// Start the writer task
    pub fn spawn(
        config: BatchConfig,
        store: Arc<dyn TickStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> (BatchHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.batch_size.max(1));
        let writer = Self {
            buffer: TickBuffer::new(config.backlog_cap()),
            size_trigger: config.batch_size.max(1),
            config,
            store,
            metrics,
        };
        let task = tokio::spawn(writer.run(rx));
        (BatchHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let period = self.config.flush_period();
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Record(tick)) => {
                            self.push(tick);
                            if self.buffer.len() >= self.size_trigger {
                                self.flush().await;
                            }
                        }
                        Some(Command::Flush(reply)) => {
                            let outcome = self.flush().await;
                            let _ = reply.send(outcome);
                        }
                        None => {
                            let outcome = self.flush().await;
                            tracing::info!(?outcome, "Batch writer shutting down");
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }
    }

    fn push(&mut self, tick: MarketTick) {
        let evicted = self.buffer.push(tick);
        if evicted > 0 {
            self.metrics.increment_backlog_evicted(evicted as u64);
            tracing::warn!(
                evicted,
                cap = self.buffer.cap,
                "Batch backlog full, dropped oldest ticks"
            );
        }
    }

    async fn flush(&mut self) -> FlushOutcome {
        if self.buffer.is_empty() {
            return FlushOutcome::Empty;
        }

        let count = self.buffer.len();
        let started = Instant::now();
        let result = self.store.insert_batch(self.buffer.as_slice()).await;
        self.metrics.record_duration(started.elapsed());

        match result {
            Ok(()) => {
                self.buffer.clear();
                self.size_trigger = self.config.batch_size.max(1);
                self.metrics.increment_processed(count as u64);
                self.metrics.record_flush(true);
                tracing::debug!(count, "Flushed tick batch");
                FlushOutcome::Written(count)
            }
            Err(e) => {
                self.size_trigger = count + self.config.batch_size.max(1);
                self.metrics.increment_errors();
                self.metrics.record_flush(false);
                tracing::error!(error = %e, buffered = count, "Failed to write tick batch");
                FlushOutcome::Failed {
                    buffered: count,
                    error: e.to_string(),
                }
            }
        }
    }
}
