//! Listener adapter interface (spec §4.10): each protocol-specific producer
//! normalizes into an `Envelope` and hands it to the spool via `EnqueueHandle`.

pub mod file_tail;
pub mod syslog_udp;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;

use crate::envelope::{self, Envelope};
use crate::error::EdgeBotError;
use crate::metrics::Metrics;
use crate::spool::Spool;

/// Handed to each listener so it can push normalized events without owning
/// the spool directly (spec §9 "do not use ambient singletons").
pub struct EnqueueHandle {
    spool: Arc<dyn Spool>,
    metrics: Arc<Metrics>,
    clock_skew_bound: ChronoDuration,
    buffer_max_size: u64,
}

impl EnqueueHandle {
    pub fn new(
        spool: Arc<dyn Spool>,
        metrics: Arc<Metrics>,
        clock_skew_bound: ChronoDuration,
        buffer_max_size: u64,
    ) -> Self {
        Self { spool, metrics, clock_skew_bound, buffer_max_size }
    }

    /// Normalizes then enqueues. Never blocks indefinitely (§4.10): the
    /// spool's `enqueue` only suspends for fsync/mutex, never on backpressure.
    ///
    /// Enforces `buffer.max_size`, an in-memory event-count cap distinct from
    /// the spool's own byte-capped budget (§2, §6.4): once pending + in-flight
    /// events reach the cap, further enqueues are rejected even if the spool
    /// still has byte headroom.
    pub async fn enqueue(&self, mut envelope: Envelope) -> Result<i64, EdgeBotError> {
        let report = envelope::normalize(&mut envelope, self.clock_skew_bound);
        if report.clock_skew_clamped {
            self.metrics.event_dropped(&envelope.source, "clock_skew");
        }
        let source = envelope.source.clone();
        self.metrics.event_ingested(&source);

        if self.buffer_max_size > 0 {
            let stats = self.spool.stats().await?;
            if stats.pending + stats.in_flight >= self.buffer_max_size {
                return Err(EdgeBotError::CapacityExceeded);
            }
        }

        self.spool.enqueue(envelope).await
    }
}

#[async_trait]
pub trait Listener: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, enqueue: Arc<EnqueueHandle>, shutdown: tokio::sync::watch::Receiver<bool>);
    fn healthy(&self) -> bool;
}
