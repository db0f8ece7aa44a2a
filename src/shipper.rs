//! The batching shipper loop (spec §4.7): one independent claim/ship cycle
//! per enabled sink, coordinated by a shared wake signal.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use crate::breaker::Breaker;
use crate::config::{BatchingConfig, RateLimitConfig, RateLimitMode, RetryConfig};
use crate::metrics::Metrics;
use crate::rate_limiter::RateLimiter;
use crate::retry::{self, RetryOutcome};
use crate::sinks::{OutboundBatch, Sink, WriteOutcome};
use crate::spool::Spool;

pub struct SinkHandle {
    pub sink: Arc<dyn Sink>,
    pub breaker: Breaker,
    pub rate_limiter: RateLimiter,
    pub retry: RetryConfig,
    /// Per-attempt send timeout, already baked into `sink` itself; threaded
    /// through separately so the claim lease can be derived from it (§4.1).
    pub timeout_ms: u64,
}

pub struct Shipper {
    spool: Arc<dyn Spool>,
    sinks: Vec<SinkHandle>,
    batching: RwLock<BatchingConfig>,
    node_source: String,
    metrics: Arc<Metrics>,
    wake: Arc<Notify>,
}

/// Default lease = 5x the per-attempt timeout (§4.1).
const LEASE_MULTIPLIER: i64 = 5;

impl Shipper {
    pub fn new(
        spool: Arc<dyn Spool>,
        sinks: Vec<SinkHandle>,
        batching: BatchingConfig,
        node_source: String,
        metrics: Arc<Metrics>,
        wake: Arc<Notify>,
    ) -> Self {
        Self { spool, sinks, batching: RwLock::new(batching), node_source, metrics, wake }
    }

    /// Hot-reloads batch sizing/timeout on SIGHUP (§4.8).
    pub fn reload_batching(&self, fresh: BatchingConfig) {
        *self.batching.write().unwrap() = fresh;
    }

    /// Hot-reloads every sink's rate limit capacity/refill on SIGHUP (§4.8).
    /// `mode` is not reloadable.
    pub fn reload_rate_limit(&self, fresh: &RateLimitConfig) {
        for handle in &self.sinks {
            handle.rate_limiter.reconfigure(fresh.capacity, fresh.refill_per_sec);
        }
    }

    fn batching(&self) -> BatchingConfig {
        self.batching.read().unwrap().clone()
    }

    /// Runs until `shutdown` fires `true`, then performs one final drain
    /// cycle per sink before returning (§4.7 step 2).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.batching().timeout()) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shipper draining before shutdown");
                        for handle in &self.sinks {
                            self.ship_once(handle).await;
                        }
                        return;
                    }
                }
            }

            if *shutdown.borrow() {
                for handle in &self.sinks {
                    self.ship_once(handle).await;
                }
                return;
            }

            for handle in &self.sinks {
                self.ship_once(handle).await;
            }
        }
    }

    async fn ship_once(&self, handle: &SinkHandle) {
        let permit = match handle.breaker.try_acquire() {
            Ok(p) => p,
            Err(_) => {
                self.metrics.breaker_state(handle.sink.name(), handle.breaker.state());
                return;
            }
        };

        let lease =
            ChronoDuration::milliseconds((handle.timeout_ms as i64).saturating_mul(LEASE_MULTIPLIER));

        let batching = self.batching();
        let records = match self.spool.claim_batch(batching.max_size, batching.max_bytes, lease).await {
            Ok(r) if r.is_empty() => {
                drop(permit);
                return;
            }
            Ok(r) => r,
            Err(e) => {
                warn!(sink = handle.sink.name(), error = %e, "claim_batch failed, treated as transient");
                drop(permit);
                return;
            }
        };

        let ids: Vec<i64> = records.iter().map(|r| r.spool_id).collect();

        let tokens = match handle.rate_limiter.mode() {
            RateLimitMode::Events => records.len() as f64,
            RateLimitMode::Bytes => records
                .iter()
                .map(|r| serde_json::to_vec(&r.envelope.payload).map(|v| v.len()).unwrap_or(0) as f64)
                .sum(),
        };
        if !handle.rate_limiter.acquire(tokens, Duration::from_secs(30)).await {
            warn!(sink = handle.sink.name(), "rate limit deadline elapsed, releasing claimed batch");
            if let Err(e) = self.spool.fail(&ids, "rate limit deadline elapsed", false).await {
                error!(sink = handle.sink.name(), error = %e, "re-queue after rate-limit backoff failed");
            }
            drop(permit);
            return;
        }

        let batch = OutboundBatch::from_records(&records, &self.node_source);
        let batch_size = batch.batch_size;

        let start = std::time::Instant::now();
        let (outcome, retries) = run_retry_loop(handle, &batch).await;
        let elapsed = start.elapsed();
        self.metrics.observe_send_duration(handle.sink.name(), elapsed.as_secs_f64());
        self.metrics.observe_batch_size(handle.sink.name(), batch_size as f64);
        for _ in 0..retries {
            self.metrics.retry(handle.sink.name());
        }

        match outcome {
            ShipOutcome::Success(count) => {
                if let Err(e) = self.spool.commit(&ids).await {
                    error!(sink = handle.sink.name(), error = %e, "commit failed after successful send");
                }
                permit.success();
                self.metrics.breaker_state(handle.sink.name(), handle.breaker.state());
                self.metrics.batch_sent(handle.sink.name(), count);
                self.metrics.bytes_sent(handle.sink.name(), estimate_batch_bytes(&batch));
            }
            ShipOutcome::PermanentFailure(err) => {
                if let Err(e) = self.spool.fail(&ids, &err.to_string(), true).await {
                    error!(sink = handle.sink.name(), error = %e, "fail(permanent) bookkeeping failed");
                }
                permit.failure();
                self.metrics.breaker_state(handle.sink.name(), handle.breaker.state());
                self.metrics.batch_failed(handle.sink.name(), "permanent");
                error!(
                    sink = handle.sink.name(),
                    batch_size,
                    last_error_kind = "permanent",
                    elapsed_ms = elapsed.as_millis() as u64,
                    "terminal batch outcome: permanent failure"
                );
            }
            ShipOutcome::CircuitOpen => {
                if let Err(e) = self.spool.fail(&ids, "circuit open", false).await {
                    error!(sink = handle.sink.name(), error = %e, "re-queue after circuit-open failed");
                }
                drop(permit);
            }
        }
    }
}

enum ShipOutcome {
    Success(usize),
    PermanentFailure(crate::error::EdgeBotError),
    CircuitOpen,
}

/// Runs the attempt loop for one batch against one sink via the shared
/// `retry::run_with_retry` helper, honoring the sink's own retry config.
/// Attempts are counted so the caller can report one `metrics.retry()` per
/// retry, matching what the shared helper itself doesn't track.
async fn run_retry_loop(handle: &SinkHandle, batch: &OutboundBatch) -> (ShipOutcome, u32) {
    let attempts = AtomicU32::new(0);

    let outcome = retry::run_with_retry(&handle.retry, |_k| {
        attempts.fetch_add(1, Ordering::Relaxed);
        async move {
            match handle.sink.write(batch).await {
                WriteOutcome::Success(n) => Ok(n),
                WriteOutcome::Error(err, retry_after) => Err((err, retry_after)),
            }
        }
    })
    .await;

    let retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
    let ship_outcome = match outcome {
        RetryOutcome::Success(n) => ShipOutcome::Success(n),
        RetryOutcome::Exhausted(err) => ShipOutcome::PermanentFailure(err),
    };
    (ship_outcome, retries)
}

fn estimate_batch_bytes(batch: &OutboundBatch) -> u64 {
    serde_json::to_vec(batch).map(|v| v.len() as u64).unwrap_or(0)
}
