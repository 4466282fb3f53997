//! Bounded worker pool

use super::batch::BatchHandle;
use crate::decoder::DecodedTick;
use crate::storage::{MarketTick, TickStore};
use crate::telemetry::PipelineMetrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// A decoded tick waiting for a worker
#[derive(Debug, Clone)]
pub struct TickJob {
    pub tick: DecodedTick,
    pub received_at: DateTime<Utc>,
}

/// What happened to an enqueued job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queue full; the job was discarded
    Dropped,
    /// Workers are gone; the job was discarded
    Closed,
}

/// Producer side of the job queue
///
/// Never waits for space: a full queue drops the incoming job.
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<TickJob>,
    metrics: Arc<PipelineMetrics>,
}

impl JobQueue {
    pub fn enqueue(&self, job: TickJob) -> EnqueueOutcome {
        match self.tx.try_send(job) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(TrySendError::Full(job)) => {
                self.metrics.increment_dropped();
                tracing::warn!(token = %job.tick.token, "Job queue full, dropping tick");
                EnqueueOutcome::Dropped
            }
            Err(TrySendError::Closed(job)) => {
                self.metrics.increment_dropped();
                tracing::debug!(token = %job.tick.token, "Job queue closed, dropping tick");
                EnqueueOutcome::Closed
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Jobs currently waiting
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where workers send finished records
#[derive(Clone)]
pub enum RecordSink {
    /// One insert per tick
    Direct(Arc<dyn TickStore>),
    /// Hand off to the batch writer
    Batched(BatchHandle),
}

impl std::fmt::Debug for RecordSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordSink::Direct(store) => f.debug_tuple("Direct").field(&store.name()).finish(),
            RecordSink::Batched(_) => f.write_str("Batched"),
        }
    }
}

impl RecordSink {
    async fn deliver(&self, record: MarketTick, metrics: &PipelineMetrics, worker_id: usize) {
        match self {
            RecordSink::Direct(store) => {
                let started = Instant::now();
                let result = store.insert_one(&record).await;
                metrics.record_duration(started.elapsed());

                match result {
                    Ok(()) => metrics.increment_processed(1),
                    Err(e) => {
                        metrics.increment_errors();
                        tracing::error!(
                            worker_id,
                            token = %record.symbol,
                            error = %e,
                            "Failed to store tick"
                        );
                    }
                }
            }
            RecordSink::Batched(handle) => {
                let symbol = record.symbol.clone();
                if handle.record(record).await.is_err() {
                    metrics.increment_errors();
                    tracing::error!(worker_id, token = %symbol, "Batch writer stopped, tick lost");
                }
            }
        }
    }
}

/// Fixed set of workers draining the job queue
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_workers` workers behind a queue of `buffer_size` jobs
    ///
    /// Workers exit once the shutdown flag is set and the queue is drained, or
    /// when every [`JobQueue`] has been dropped.
    pub fn start(
        num_workers: usize,
        buffer_size: usize,
        sink: RecordSink,
        metrics: Arc<PipelineMetrics>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JobQueue) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..num_workers.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let sink = sink.clone();
                let metrics = metrics.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_worker(worker_id, rx, sink, metrics, shutdown).await;
                })
            })
            .collect::<Vec<_>>();

        tracing::info!(num_workers = workers.len(), buffer_size, ?sink, "Worker pool started");

        (Self { workers }, JobQueue { tx, metrics })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<TickJob>>>,
    sink: RecordSink,
    metrics: Arc<PipelineMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(worker_id, "Worker started");
    let mut draining = false;

    while let Some(job) = next_job(&rx, &mut shutdown, &mut draining).await {
        let record = MarketTick::from_tick(&job.tick, job.received_at);
        sink.deliver(record, &metrics, worker_id).await;
    }

    tracing::debug!(worker_id, "Worker stopped");
}

/// Next job, or `None` when the worker should stop
async fn next_job(
    rx: &Mutex<mpsc::Receiver<TickJob>>,
    shutdown: &mut watch::Receiver<bool>,
    draining: &mut bool,
) -> Option<TickJob> {
    let mut rx = rx.lock().await;
    if *draining {
        return rx.try_recv().ok();
    }

    tokio::select! {
        job = rx.recv() => job,
        _ = shutdown.wait_for(|stop| *stop) => {
            *draining = true;
            rx.try_recv().ok()
        }
    }
}
