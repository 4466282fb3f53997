//! Stream message handler

use super::pool::{JobQueue, TickJob};
use crate::decoder::decode;
use crate::telemetry::PipelineMetrics;
use crate::ws::MessageHandler;
use chrono::Utc;
use std::sync::Arc;

/// Decodes inbound frames and queues them for the workers
///
/// Runs on the connection task, so it never waits: bad packets are counted
/// and skipped, and a full queue drops the tick.
#[derive(Debug, Clone)]
pub struct TickHandler {
    queue: JobQueue,
    metrics: Arc<PipelineMetrics>,
}

impl TickHandler {
    pub fn new(queue: JobQueue, metrics: Arc<PipelineMetrics>) -> Self {
        Self { queue, metrics }
    }
}

impl MessageHandler for TickHandler {
    fn on_message(&self, data: &[u8]) {
        let received_at = Utc::now();
        match decode(data) {
            Ok(tick) => {
                tracing::trace!(token = %tick.token, seq = tick.sequence_number, "Tick received");
                self.queue.enqueue(TickJob { tick, received_at });
            }
            Err(e) => {
                self.metrics.increment_decode_errors();
                tracing::warn!(error = %e, len = data.len(), "Failed to decode packet");
            }
        }
    }
}
