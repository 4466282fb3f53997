//! Tick processing pipeline
//!
//! The stream handler decodes frames into a bounded job queue; a fixed pool of
//! workers turns them into storage records and writes them either one at a
//! time or through the batch writer.

mod batch;
mod handler;
mod pool;

pub use batch::{BatchClosed, BatchConfig, BatchHandle, BatchWriter, FlushOutcome};
pub use handler::TickHandler;
pub use pool::{EnqueueOutcome, JobQueue, RecordSink, TickJob, WorkerPool};
