//! End-to-end shipper contract tests driving the full claim/ship/commit cycle
//! against a real `Spool` and an HTTP sink backed by `wiremock` (spec §4.7).

use std::sync::Arc;
use std::time::Duration;

use edgebot::breaker::Breaker;
use edgebot::config::{BatchingConfig, RateLimitMode, RetryConfig, TlsConfig};
use edgebot::envelope::{Envelope, Labels};
use edgebot::listener::EnqueueHandle;
use edgebot::metrics::Metrics;
use edgebot::rate_limiter::RateLimiter;
use edgebot::shipper::{Shipper, SinkHandle};
use edgebot::sinks::http::HttpSink;
use edgebot::spool::memory::MemorySpool;
use edgebot::spool::Spool;
use tokio::sync::{watch, Notify};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn event(msg: &str) -> Envelope {
    Envelope {
        spool_id: None,
        received_at: chrono::Utc::now(),
        event_ts: chrono::Utc::now(),
        event_type: "syslog".to_string(),
        source: "syslog_udp".to_string(),
        labels: Labels::new(),
        payload: serde_json::json!({ "msg": msg }),
        attempts: 0,
    }
}

fn handle(server: &MockServer) -> SinkHandle {
    let sink = HttpSink::new(server.uri(), None, &TlsConfig::default(), false, 2_000).unwrap();
    SinkHandle {
        sink: Arc::new(sink),
        breaker: Breaker::new(3, Duration::from_millis(200), 2),
        rate_limiter: RateLimiter::new(1000.0, 1000.0, RateLimitMode::Events),
        retry: RetryConfig { max_retries: 3, initial_backoff_ms: 5, max_backoff_ms: 100, jitter_factor: 0.0 },
        timeout_ms: 2_000,
    }
}

/// Scenario 1: three events ship as one batch and the spool ends up empty.
#[tokio::test]
async fn happy_path_ships_one_batch_and_empties_spool() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(1).mount(&server).await;

    let spool: Arc<dyn Spool> = Arc::new(MemorySpool::new(1_000_000));
    spool.enqueue(event("a")).await.unwrap();
    spool.enqueue(event("b")).await.unwrap();
    spool.enqueue(event("c")).await.unwrap();

    let metrics = Arc::new(Metrics::new());
    let wake = Arc::new(Notify::new());
    let batching = BatchingConfig { max_size: 500, max_bytes: 1_048_576, timeout_ms: 50 };
    let shipper =
        Shipper::new(spool.clone(), vec![handle(&server)], batching, "node-1".to_string(), metrics, wake);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { shipper.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();

    let stats = spool.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_flight, 0);
}

/// Scenario 3: a permanent 400 dead-letters without ever retrying.
#[tokio::test]
async fn permanent_failure_dead_letters_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(400)).expect(1).mount(&server).await;

    let spool: Arc<dyn Spool> = Arc::new(MemorySpool::new(1_000_000));
    spool.enqueue(event("bad")).await.unwrap();

    let metrics = Arc::new(Metrics::new());
    let wake = Arc::new(Notify::new());
    let batching = BatchingConfig { max_size: 500, max_bytes: 1_048_576, timeout_ms: 50 };
    let shipper =
        Shipper::new(spool.clone(), vec![handle(&server)], batching, "node-1".to_string(), metrics, wake);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { shipper.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();

    let stats = spool.stats().await.unwrap();
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.pending, 0);
}

/// Scenario 6: with `buffer.max_size=100`, enqueueing 200 events yields the
/// first 100 accepted and the next 100 rejected with `CapacityExceeded`, and
/// the listener-side drop counter reaches exactly 100.
#[tokio::test]
async fn backpressure_rejects_once_buffer_is_full() {
    let spool: Arc<dyn Spool> = Arc::new(MemorySpool::new(1_000_000_000));
    let metrics = Arc::new(Metrics::new());
    let clock_skew_bound = edgebot::envelope::DEFAULT_CLOCK_SKEW_BOUND;
    let handle = EnqueueHandle::new(spool, metrics.clone(), clock_skew_bound, 100);

    let mut accepted = 0;
    let mut rejected = 0;
    for i in 0..200 {
        match handle.enqueue(event(&format!("msg-{i}"))).await {
            Ok(_) => accepted += 1,
            Err(edgebot::error::EdgeBotError::CapacityExceeded) => {
                rejected += 1;
                metrics.event_dropped("syslog_udp", "spool_full");
            }
            Err(e) => panic!("unexpected enqueue error: {e}"),
        }
    }

    assert_eq!(accepted, 100);
    assert_eq!(rejected, 100);

    let text = metrics.encode_text();
    let line = text
        .lines()
        .find(|l| l.contains("edgebot_events_dropped_total") && l.contains("spool_full") && l.contains("syslog_udp"))
        .expect("dropped-events counter present");
    let value: f64 = line.rsplit(' ').next().unwrap().parse().unwrap();
    assert_eq!(value, 100.0);
}
