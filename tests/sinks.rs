//! Sink contract tests: sanitization (P8), HTTP happy path (scenario 1), file
//! round-trip (P9).

use edgebot::config::TlsConfig;
use edgebot::envelope::{Envelope, Labels};
use edgebot::sinks::file::FileSink;
use edgebot::sinks::http::HttpSink;
use edgebot::sinks::{OutboundBatch, Sink, WriteOutcome};
use edgebot::spool::{SpoolRecord, Status};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn record(id: i64, msg: &str) -> SpoolRecord {
    let mut labels = Labels::new();
    labels.insert("host".to_string(), "edge-01".to_string());
    let envelope = Envelope {
        spool_id: Some(id),
        received_at: chrono::Utc::now(),
        event_ts: chrono::Utc::now(),
        event_type: "syslog".to_string(),
        source: "syslog_udp".to_string(),
        labels,
        payload: serde_json::json!({ "msg": msg, "__internal_marker": "drop me" }),
        attempts: 0,
    };
    SpoolRecord {
        spool_id: id,
        envelope,
        status: Status::InFlight,
        claim_deadline: None,
        last_error: None,
        enqueued_at: chrono::Utc::now(),
        last_attempt_at: None,
    }
}

#[test]
fn sanitized_batch_drops_spool_id_attempts_and_dunder_keys() {
    let records = vec![record(1, "a"), record(2, "b")];
    let batch = OutboundBatch::from_records(&records, "node-1");
    let json = serde_json::to_value(&batch).unwrap();

    let serialized = json.to_string();
    assert!(!serialized.contains("spool_id"));
    assert!(!serialized.contains("\"attempts\""));
    assert!(!serialized.contains("__internal_marker"));

    assert_eq!(batch.batch_size, 2);
    assert_eq!(json["messages"][0]["payload"]["msg"], "a");
}

/// Scenario 1: happy path HTTP, one batch posted, 200 returned.
#[tokio::test]
async fn http_sink_posts_ordered_batch_and_succeeds_on_200() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let sink =
        HttpSink::new(format!("{}/ingest", server.uri()), None, &TlsConfig::default(), false, 5_000).unwrap();

    let records = vec![record(1, "a"), record(2, "b"), record(3, "c")];
    let batch = OutboundBatch::from_records(&records, "node-1");
    assert_eq!(batch.batch_size, 3);

    let outcome = sink.write(&batch).await;
    assert!(matches!(outcome, WriteOutcome::Success(3)));
}

#[tokio::test]
async fn http_sink_classifies_503_as_transient_with_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "2"))
        .mount(&server)
        .await;

    let sink = HttpSink::new(server.uri(), None, &TlsConfig::default(), false, 5_000).unwrap();
    let batch = OutboundBatch::from_records(&[record(1, "a")], "node-1");

    match sink.write(&batch).await {
        WriteOutcome::Error(err, retry_after) => {
            assert!(err.is_transient());
            assert_eq!(retry_after, Some(2.0));
        }
        WriteOutcome::Success(_) => panic!("expected an error outcome"),
    }
}

#[tokio::test]
async fn http_sink_classifies_400_as_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(400)).mount(&server).await;

    let sink = HttpSink::new(server.uri(), None, &TlsConfig::default(), false, 5_000).unwrap();
    let batch = OutboundBatch::from_records(&[record(1, "a")], "node-1");

    match sink.write(&batch).await {
        WriteOutcome::Error(err, _) => assert!(err.is_permanent()),
        WriteOutcome::Success(_) => panic!("expected an error outcome"),
    }
}

/// A handshake failure (here: speaking TLS at a plain-HTTP listener) is
/// permanent, not transient — retrying won't change the outcome (§4.5, §7).
#[tokio::test]
async fn http_sink_classifies_connect_failure_as_permanent() {
    let server = MockServer::start().await;
    let https_uri = server.uri().replacen("http://", "https://", 1);

    let sink = HttpSink::new(https_uri, None, &TlsConfig::default(), false, 2_000).unwrap();
    let batch = OutboundBatch::from_records(&[record(1, "a")], "node-1");

    match sink.write(&batch).await {
        WriteOutcome::Error(err, _) => assert!(err.is_permanent()),
        WriteOutcome::Success(_) => panic!("expected a connect-failure error outcome"),
    }
}

/// P9: file sink's `.json.gz` sibling decompresses to exactly the `.json` bytes.
#[tokio::test]
async fn file_sink_gz_sibling_round_trips_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FileSink::new(&format!("file://{}", dir.path().display()), true).unwrap();
    let batch = OutboundBatch::from_records(&[record(1, "a")], "node-1");

    let outcome = sink.write(&batch).await;
    assert!(matches!(outcome, WriteOutcome::Success(1)));

    let mut json_bytes = None;
    let mut gz_bytes = None;
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        if path.to_string_lossy().ends_with(".json.gz") {
            gz_bytes = Some(std::fs::read(&path).unwrap());
        } else if path.extension().map(|e| e == "json").unwrap_or(false) {
            json_bytes = Some(std::fs::read(&path).unwrap());
        }
    }

    use flate2::read::GzDecoder;
    use std::io::Read;
    let mut decompressed = Vec::new();
    GzDecoder::new(&gz_bytes.expect("gz sibling written")[..]).read_to_end(&mut decompressed).unwrap();

    assert_eq!(json_bytes.expect("json written"), decompressed);
}
