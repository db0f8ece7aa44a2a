//! Prometheus metrics registry (spec §6.6).

use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::breaker::State as BreakerState;

pub struct Metrics {
    registry: Registry,
    events_ingested_total: IntCounterVec,
    events_dropped_total: IntCounterVec,
    batches_sent_total: IntCounterVec,
    events_sent_total: IntCounterVec,
    batches_failed_total: IntCounterVec,
    retries_total: IntCounterVec,
    bytes_sent_total: IntCounterVec,
    spool_pending: IntGauge,
    spool_inflight: IntGauge,
    spool_bytes: IntGauge,
    breaker_state: IntGaugeVec,
    up: IntGauge,
    component_healthy: IntGaugeVec,
    send_duration_seconds: HistogramVec,
    batch_size_events: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        macro_rules! counter_vec {
            ($name:literal, $help:literal, $labels:expr) => {{
                let vec = IntCounterVec::new(Opts::new($name, $help), $labels).unwrap();
                registry.register(Box::new(vec.clone())).unwrap();
                vec
            }};
        }
        macro_rules! gauge_vec {
            ($name:literal, $help:literal, $labels:expr) => {{
                let vec = IntGaugeVec::new(Opts::new($name, $help), $labels).unwrap();
                registry.register(Box::new(vec.clone())).unwrap();
                vec
            }};
        }

        let events_ingested_total = counter_vec!(
            "edgebot_events_ingested_total",
            "Events accepted by a listener",
            &["source"]
        );
        let events_dropped_total = counter_vec!(
            "edgebot_events_dropped_total",
            "Events dropped before or during spooling",
            &["source", "reason"]
        );
        let batches_sent_total =
            counter_vec!("edgebot_batches_sent_total", "Batches successfully shipped", &["sink"]);
        let events_sent_total =
            counter_vec!("edgebot_events_sent_total", "Events successfully shipped", &["sink"]);
        let batches_failed_total = counter_vec!(
            "edgebot_batches_failed_total",
            "Batches that failed terminally",
            &["sink", "kind"]
        );
        let retries_total = counter_vec!("edgebot_retries_total", "Retry attempts issued", &["sink"]);
        let bytes_sent_total =
            counter_vec!("edgebot_bytes_sent_total", "Bytes successfully shipped", &["sink"]);

        let spool_pending = IntGauge::new("edgebot_spool_pending", "Pending spool records").unwrap();
        registry.register(Box::new(spool_pending.clone())).unwrap();
        let spool_inflight = IntGauge::new("edgebot_spool_inflight", "In-flight spool records").unwrap();
        registry.register(Box::new(spool_inflight.clone())).unwrap();
        let spool_bytes = IntGauge::new("edgebot_spool_bytes", "Total spool size in bytes").unwrap();
        registry.register(Box::new(spool_bytes.clone())).unwrap();
        let breaker_state = gauge_vec!("edgebot_breaker_state", "Breaker state: 0=closed 1=open 2=half_open", &["sink"]);
        let up = IntGauge::new("edgebot_up", "Process liveness").unwrap();
        registry.register(Box::new(up.clone())).unwrap();
        let component_healthy = gauge_vec!("edgebot_component_healthy", "Per-component health", &["name"]);

        let send_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new("edgebot_send_duration_seconds", "Sink write latency"),
            &["sink"],
        )
        .unwrap();
        registry.register(Box::new(send_duration_seconds.clone())).unwrap();

        let batch_size_events = HistogramVec::new(
            prometheus::HistogramOpts::new("edgebot_batch_size_events", "Events per shipped batch")
                .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]),
            &["sink"],
        )
        .unwrap();
        registry.register(Box::new(batch_size_events.clone())).unwrap();

        Self {
            registry,
            events_ingested_total,
            events_dropped_total,
            batches_sent_total,
            events_sent_total,
            batches_failed_total,
            retries_total,
            bytes_sent_total,
            spool_pending,
            spool_inflight,
            spool_bytes,
            breaker_state,
            up,
            component_healthy,
            send_duration_seconds,
            batch_size_events,
        }
    }

    pub fn event_ingested(&self, source: &str) {
        self.events_ingested_total.with_label_values(&[source]).inc();
    }

    pub fn event_dropped(&self, source: &str, reason: &str) {
        self.events_dropped_total.with_label_values(&[source, reason]).inc();
    }

    pub fn batch_sent(&self, sink: &str, count: usize) {
        self.batches_sent_total.with_label_values(&[sink]).inc();
        self.events_sent_total.with_label_values(&[sink]).inc_by(count as u64);
    }

    pub fn batch_failed(&self, sink: &str, kind: &str) {
        self.batches_failed_total.with_label_values(&[sink, kind]).inc();
    }

    pub fn retry(&self, sink: &str) {
        self.retries_total.with_label_values(&[sink]).inc();
    }

    pub fn bytes_sent(&self, sink: &str, bytes: u64) {
        self.bytes_sent_total.with_label_values(&[sink]).inc_by(bytes);
    }

    pub fn set_spool_stats(&self, stats: &crate::spool::SpoolStats) {
        self.spool_pending.set(stats.pending as i64);
        self.spool_inflight.set(stats.in_flight as i64);
        self.spool_bytes.set(stats.total_bytes as i64);
    }

    pub fn breaker_state(&self, sink: &str, state: BreakerState) {
        self.breaker_state.with_label_values(&[sink]).set(state.as_gauge());
    }

    pub fn set_up(&self, up: bool) {
        self.up.set(if up { 1 } else { 0 });
    }

    pub fn component_healthy(&self, name: &str, healthy: bool) {
        self.component_healthy.with_label_values(&[name]).set(if healthy { 1 } else { 0 });
    }

    pub fn observe_send_duration(&self, sink: &str, seconds: f64) {
        self.send_duration_seconds.with_label_values(&[sink]).observe(seconds);
    }

    pub fn observe_batch_size(&self, sink: &str, size: f64) {
        self.batch_size_events.with_label_values(&[sink]).observe(size);
    }

    pub fn encode_text(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).expect("prometheus text encoding cannot fail");
        String::from_utf8(buf).expect("prometheus output is always valid UTF-8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
