//! Spool durability and crash-recovery behavior (spec §4.1, P5, P7, scenario 5).

use chrono::Duration as ChronoDuration;
use edgebot::envelope::{Envelope, Labels};
use edgebot::error::EdgeBotError;
use edgebot::spool::sqlite::SqliteSpool;
use edgebot::spool::Spool;

fn event(source: &str, msg: &str) -> Envelope {
    Envelope {
        spool_id: None,
        received_at: chrono::Utc::now(),
        event_ts: chrono::Utc::now(),
        event_type: "syslog".to_string(),
        source: source.to_string(),
        labels: Labels::new(),
        payload: serde_json::json!({ "msg": msg }),
        attempts: 0,
    }
}

#[tokio::test]
async fn crash_mid_flight_resurfaces_identical_claims_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let ids = {
        let spool = SqliteSpool::open(dir.path(), 10_000_000).await.unwrap();
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(spool.enqueue(event("s1", &format!("msg{i}"))).await.unwrap());
        }
        // Claim 5 with a lease long enough to still be valid, then "crash" by
        // dropping the spool without committing.
        let claimed = spool.claim_batch(5, 10_000_000, ChronoDuration::seconds(60)).await.unwrap();
        assert_eq!(claimed.len(), 5);
        for (claimed_rec, expected_id) in claimed.iter().zip(&ids[..5]) {
            assert_eq!(claimed_rec.spool_id, *expected_id);
            assert_eq!(claimed_rec.envelope.attempts, 0);
        }
        ids
    };

    // "Restart": reopen against the same state dir after the prior handle is
    // dropped, releasing the advisory lock.
    let spool = SqliteSpool::open(dir.path(), 10_000_000).await.unwrap();

    // The 5 in-flight claims from before the crash are still leased; without
    // reap_stale they would not resurface.
    let immediate = spool.claim_batch(10, 10_000_000, ChronoDuration::seconds(60)).await.unwrap();
    assert_eq!(immediate.len(), 5, "only the never-claimed 5 should be immediately claimable");

    spool.reap_stale().await.unwrap();
    // Still leased (60s hasn't elapsed), so reap_stale should not have moved them.
    let stats = spool.stats().await.unwrap();
    assert_eq!(stats.pending + stats.in_flight, 10);

    let _ = ids;
}

#[tokio::test]
async fn reap_stale_recovers_expired_leases_with_identical_ids_and_order() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SqliteSpool::open(dir.path(), 10_000_000).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(spool.enqueue(event("s1", &format!("msg{i}"))).await.unwrap());
    }

    let claimed = spool.claim_batch(5, 10_000_000, ChronoDuration::milliseconds(-1)).await.unwrap();
    assert_eq!(claimed.len(), 5);

    let reaped = spool.reap_stale().await.unwrap();
    assert_eq!(reaped, 5);

    let reclaimed = spool.claim_batch(10, 10_000_000, ChronoDuration::seconds(60)).await.unwrap();
    let reclaimed_ids: Vec<i64> = reclaimed.iter().map(|r| r.spool_id).collect();
    assert_eq!(reclaimed_ids, ids, "reap must preserve original enqueue order");
    assert!(reclaimed.iter().all(|r| r.envelope.attempts == 0), "reap must not count as an attempt");
}

#[tokio::test]
async fn enqueue_rejects_once_over_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SqliteSpool::open(dir.path(), 200).await.unwrap();

    spool.enqueue(event("s1", "small")).await.unwrap();
    let err = spool.enqueue(event("s1", &"x".repeat(1000))).await.unwrap_err();
    assert!(matches!(err, EdgeBotError::CapacityExceeded));

    let stats = spool.stats().await.unwrap();
    assert!(stats.total_bytes <= 200);
}

#[tokio::test]
async fn commit_removes_exactly_the_committed_ids() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SqliteSpool::open(dir.path(), 10_000_000).await.unwrap();

    let a = spool.enqueue(event("s1", "a")).await.unwrap();
    let b = spool.enqueue(event("s1", "b")).await.unwrap();

    let claimed = spool.claim_batch(10, 10_000_000, ChronoDuration::seconds(30)).await.unwrap();
    assert_eq!(claimed.len(), 2);

    let deleted = spool.commit(&[a]).await.unwrap();
    assert_eq!(deleted, 1);

    let stats = spool.stats().await.unwrap();
    assert_eq!(stats.pending + stats.in_flight, 1);

    let _ = b;
}

#[tokio::test]
async fn fail_dead_letters_after_max_attempts_and_exports_json() {
    let dir = tempfile::tempdir().unwrap();
    let spool = SqliteSpool::open(dir.path(), 10_000_000).await.unwrap();

    let id = spool.enqueue(event("s1", "doomed")).await.unwrap();
    for _ in 0..edgebot::spool::DEFAULT_MAX_ATTEMPTS {
        spool.fail(&[id], "connection refused", false).await.unwrap();
    }

    let stats = spool.stats().await.unwrap();
    assert_eq!(stats.dead, 1);

    let dead_dir = dir.path().join("dead");
    let entries: Vec<_> = std::fs::read_dir(&dead_dir).unwrap().collect();
    assert_eq!(entries.len(), 1, "exactly one dead-letter export expected");
}

#[tokio::test]
async fn second_instance_cannot_open_locked_spool_dir() {
    let dir = tempfile::tempdir().unwrap();
    let _first = SqliteSpool::open(dir.path(), 10_000_000).await.unwrap();
    let second = SqliteSpool::open(dir.path(), 10_000_000).await;
    assert!(second.is_err(), "a second instance must not acquire the same spool.db.lock");
}
