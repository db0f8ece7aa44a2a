//! Durable, rusqlite-backed spool implementation (spec §4.1, §6.5).
//!
//! One `events` table keyed by `spool_id INTEGER PRIMARY KEY AUTOINCREMENT`,
//! matching the "single table keyed by monotonic id" suggestion in §6.5.
//! `rusqlite` is synchronous; every call runs on `spawn_blocking` behind a
//! `tokio::sync::Mutex` so the spool remains a single-writer structure
//! in-process (§4.1) without blocking the async runtime's worker threads.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::warn;

use crate::envelope::Envelope;
use crate::error::EdgeBotError;

use super::{truncate_error, Spool, SpoolRecord, SpoolStats, Status, DEFAULT_MAX_ATTEMPTS};

pub struct SqliteSpool {
    conn: Arc<Mutex<Connection>>,
    max_bytes: u64,
    max_attempts: u32,
    dead_letter_dir: Option<PathBuf>,
    _lock_file: File,
}

impl SqliteSpool {
    pub async fn open(state_dir: &Path, max_bytes: u64) -> Result<Self, EdgeBotError> {
        let state_dir = state_dir.to_path_buf();
        std::fs::create_dir_all(&state_dir)
            .map_err(|e| EdgeBotError::Unavailable(format!("creating state dir: {e}")))?;

        let lock_guard = lock_spool_dir(&state_dir)?;

        let db_path = state_dir.join("spool.db");
        let dead_dir = state_dir.join("dead");
        std::fs::create_dir_all(&dead_dir)
            .map_err(|e| EdgeBotError::Unavailable(format!("creating dead-letter dir: {e}")))?;

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, EdgeBotError> {
            let conn = Connection::open(&db_path)
                .map_err(|e| EdgeBotError::Unavailable(format!("opening spool db: {e}")))?;
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=FULL;
                 CREATE TABLE IF NOT EXISTS events (
                     spool_id INTEGER PRIMARY KEY AUTOINCREMENT,
                     received_at TEXT NOT NULL,
                     event_ts TEXT NOT NULL,
                     event_type TEXT NOT NULL,
                     source TEXT NOT NULL,
                     labels TEXT NOT NULL,
                     payload TEXT NOT NULL,
                     attempts INTEGER NOT NULL DEFAULT 0,
                     status TEXT NOT NULL DEFAULT 'pending',
                     claim_deadline TEXT,
                     last_error TEXT,
                     enqueued_at TEXT NOT NULL,
                     last_attempt_at TEXT,
                     byte_len INTEGER NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_events_status ON events(status, spool_id);",
            )
            .map_err(|e| EdgeBotError::Unavailable(format!("migrating spool db: {e}")))?;
            Ok(conn)
        })
        .await
        .map_err(|e| EdgeBotError::Unavailable(format!("spool init task: {e}")))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_bytes,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            dead_letter_dir: Some(dead_dir),
            _lock_file: lock_guard,
        })
    }
}

/// Advisory-locks `spool.db.lock`, writing this process's PID (§6.5).
/// Returns `Unavailable` if another instance already holds it.
fn lock_spool_dir(state_dir: &Path) -> Result<File, EdgeBotError> {
    let lock_path = state_dir.join("spool.db.lock");
    let mut file = File::create(&lock_path)
        .map_err(|e| EdgeBotError::Unavailable(format!("creating {}: {e}", lock_path.display())))?;
    file.try_lock_exclusive().map_err(|_| {
        EdgeBotError::Unavailable(format!(
            "{} is held by another edgebot instance",
            lock_path.display()
        ))
    })?;
    file.set_len(0).ok();
    let _ = write!(file, "{}", std::process::id());
    Ok(file)
}

#[async_trait]
impl Spool for SqliteSpool {
    async fn enqueue(&self, envelope: Envelope) -> Result<i64, EdgeBotError> {
        let conn = self.conn.clone();
        let max_bytes = self.max_bytes;
        let payload = serde_json::to_string(&envelope.payload)
            .map_err(|e| EdgeBotError::Permanent(format!("serializing payload: {e}")))?;
        let labels = serde_json::to_string(&envelope.labels)
            .map_err(|e| EdgeBotError::Permanent(format!("serializing labels: {e}")))?;
        let byte_len = (payload.len() + labels.len() + envelope.event_type.len() + envelope.source.len()) as i64;
        let now = Utc::now();

        tokio::task::spawn_blocking(move || -> Result<i64, EdgeBotError> {
            let conn = conn.blocking_lock();
            let current: i64 = conn
                .query_row("SELECT COALESCE(SUM(byte_len), 0) FROM events", [], |r| r.get(0))
                .map_err(|e| EdgeBotError::Unavailable(format!("reading spool size: {e}")))?;
            if (current as u64).saturating_add(byte_len as u64) > max_bytes {
                return Err(EdgeBotError::CapacityExceeded);
            }
            conn.execute(
                "INSERT INTO events
                 (received_at, event_ts, event_type, source, labels, payload, attempts, status, enqueued_at, byte_len)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'pending', ?7, ?8)",
                params![
                    envelope.received_at.to_rfc3339(),
                    envelope.event_ts.to_rfc3339(),
                    envelope.event_type,
                    envelope.source,
                    labels,
                    payload,
                    now.to_rfc3339(),
                    byte_len,
                ],
            )
            .map_err(|e| EdgeBotError::Unavailable(format!("inserting event: {e}")))?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| EdgeBotError::Unavailable(format!("enqueue task: {e}")))?
    }

    async fn claim_batch(
        &self,
        max_count: usize,
        max_bytes: u64,
        lease_duration: ChronoDuration,
    ) -> Result<Vec<SpoolRecord>, EdgeBotError> {
        let conn = self.conn.clone();
        let now = Utc::now();
        let deadline = now + lease_duration;

        tokio::task::spawn_blocking(move || -> Result<Vec<SpoolRecord>, EdgeBotError> {
            let mut conn = conn.blocking_lock();
            let tx = conn
                .transaction()
                .map_err(|e| EdgeBotError::Unavailable(format!("starting claim tx: {e}")))?;

            let mut stmt = tx
                .prepare(
                    "SELECT spool_id, received_at, event_ts, event_type, source, labels, payload,
                            attempts, status, claim_deadline, last_error, enqueued_at, last_attempt_at, byte_len
                     FROM events
                     WHERE status = 'pending' OR (status = 'in_flight' AND claim_deadline < ?1)
                     ORDER BY spool_id ASC",
                )
                .map_err(|e| EdgeBotError::Unavailable(format!("preparing claim query: {e}")))?;

            let rows = stmt
                .query_map(params![now.to_rfc3339()], row_to_record)
                .map_err(|e| EdgeBotError::Unavailable(format!("scanning claim candidates: {e}")))?;

            let mut picked = Vec::new();
            let mut byte_total: u64 = 0;
            for row in rows {
                let rec = row.map_err(|e| EdgeBotError::Unavailable(format!("reading row: {e}")))?;
                if picked.len() >= max_count {
                    break;
                }
                let rec_bytes = estimate_bytes(&rec);
                if !picked.is_empty() && byte_total + rec_bytes > max_bytes {
                    break;
                }
                byte_total += rec_bytes;
                picked.push(rec);
            }
            drop(stmt);

            for rec in &picked {
                tx.execute(
                    "UPDATE events SET status = 'in_flight', claim_deadline = ?1 WHERE spool_id = ?2",
                    params![deadline.to_rfc3339(), rec.spool_id],
                )
                .map_err(|e| EdgeBotError::Unavailable(format!("claiming record: {e}")))?;
            }

            tx.commit()
                .map_err(|e| EdgeBotError::Unavailable(format!("committing claim tx: {e}")))?;

            Ok(picked
                .into_iter()
                .map(|mut r| {
                    r.status = Status::InFlight;
                    r.claim_deadline = Some(deadline);
                    r
                })
                .collect())
        })
        .await
        .map_err(|e| EdgeBotError::Unavailable(format!("claim task: {e}")))?
    }

    async fn commit(&self, spool_ids: &[i64]) -> Result<u64, EdgeBotError> {
        let conn = self.conn.clone();
        let ids = spool_ids.to_vec();
        tokio::task::spawn_blocking(move || -> Result<u64, EdgeBotError> {
            let conn = conn.blocking_lock();
            let mut deleted = 0u64;
            for id in ids {
                deleted += conn
                    .execute("DELETE FROM events WHERE spool_id = ?1", params![id])
                    .map_err(|e| EdgeBotError::Unavailable(format!("committing {id}: {e}")))? as u64;
            }
            Ok(deleted)
        })
        .await
        .map_err(|e| EdgeBotError::Unavailable(format!("commit task: {e}")))?
    }

    async fn fail(&self, spool_ids: &[i64], error: &str, permanent: bool) -> Result<(), EdgeBotError> {
        let conn = self.conn.clone();
        let ids = spool_ids.to_vec();
        let error = truncate_error(error);
        let max_attempts = self.max_attempts;
        let dead_dir = self.dead_letter_dir.clone();
        let now = Utc::now();

        tokio::task::spawn_blocking(move || -> Result<(), EdgeBotError> {
            let mut conn = conn.blocking_lock();
            let tx = conn
                .transaction()
                .map_err(|e| EdgeBotError::Unavailable(format!("starting fail tx: {e}")))?;

            let mut dead_records = Vec::new();

            for id in ids {
                let attempts: i64 = tx
                    .query_row("SELECT attempts FROM events WHERE spool_id = ?1", params![id], |r| r.get(0))
                    .optional()
                    .map_err(|e| EdgeBotError::Unavailable(format!("reading attempts for {id}: {e}")))?
                    .unwrap_or(0);
                let next_attempts = attempts + 1;
                let goes_dead = permanent || (next_attempts as u32) >= max_attempts;

                if goes_dead {
                    tx.execute(
                        "UPDATE events SET status = 'dead', attempts = ?1, last_error = ?2, last_attempt_at = ?3, claim_deadline = NULL WHERE spool_id = ?4",
                        params![next_attempts, error, now.to_rfc3339(), id],
                    )
                    .map_err(|e| EdgeBotError::Unavailable(format!("dead-lettering {id}: {e}")))?;

                    if dead_dir.is_some() {
                        if let Some(record) = read_record(&tx, id)? {
                            dead_records.push(record);
                        }
                    }
                } else {
                    tx.execute(
                        "UPDATE events SET status = 'pending', attempts = ?1, last_error = ?2, last_attempt_at = ?3, claim_deadline = NULL WHERE spool_id = ?4",
                        params![next_attempts, error, now.to_rfc3339(), id],
                    )
                    .map_err(|e| EdgeBotError::Unavailable(format!("re-queueing {id}: {e}")))?;
                }
            }

            tx.commit().map_err(|e| EdgeBotError::Unavailable(format!("committing fail tx: {e}")))?;

            if let Some(dir) = &dead_dir {
                for record in &dead_records {
                    export_dead_letter(dir, record);
                }
            }

            Ok(())
        })
        .await
        .map_err(|e| EdgeBotError::Unavailable(format!("fail task: {e}")))?
    }

    async fn stats(&self) -> Result<SpoolStats, EdgeBotError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<SpoolStats, EdgeBotError> {
            let conn = conn.blocking_lock();
            let mut stats = SpoolStats::default();
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*), COALESCE(SUM(byte_len), 0) FROM events GROUP BY status")
                .map_err(|e| EdgeBotError::Unavailable(format!("preparing stats query: {e}")))?;
            let rows = stmt
                .query_map([], |r| {
                    let status: String = r.get(0)?;
                    let count: i64 = r.get(1)?;
                    let bytes: i64 = r.get(2)?;
                    Ok((status, count as u64, bytes as u64))
                })
                .map_err(|e| EdgeBotError::Unavailable(format!("scanning stats: {e}")))?;
            for row in rows {
                let (status, count, bytes) = row.map_err(|e| EdgeBotError::Unavailable(format!("reading stats row: {e}")))?;
                stats.total_bytes += bytes;
                match status.as_str() {
                    "pending" => stats.pending = count,
                    "in_flight" => stats.in_flight = count,
                    "failed" => stats.failed = count,
                    "dead" => stats.dead = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
        .await
        .map_err(|e| EdgeBotError::Unavailable(format!("stats task: {e}")))?
    }

    async fn reap_stale(&self) -> Result<u64, EdgeBotError> {
        let conn = self.conn.clone();
        let now = Utc::now();
        tokio::task::spawn_blocking(move || -> Result<u64, EdgeBotError> {
            let conn = conn.blocking_lock();
            let reaped = conn
                .execute(
                    "UPDATE events SET status = 'pending', claim_deadline = NULL
                     WHERE status = 'in_flight' AND claim_deadline < ?1",
                    params![now.to_rfc3339()],
                )
                .map_err(|e| EdgeBotError::Unavailable(format!("reaping stale claims: {e}")))?;
            if reaped > 0 {
                warn!(count = reaped, "reaped stale in-flight spool records");
            }
            Ok(reaped as u64)
        })
        .await
        .map_err(|e| EdgeBotError::Unavailable(format!("reap task: {e}")))?
    }
}

fn estimate_bytes(rec: &SpoolRecord) -> u64 {
    serde_json::to_vec(&rec.envelope.payload).map(|v| v.len() as u64).unwrap_or(0)
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<SpoolRecord> {
    let spool_id: i64 = row.get(0)?;
    let received_at: String = row.get(1)?;
    let event_ts: String = row.get(2)?;
    let event_type: String = row.get(3)?;
    let source: String = row.get(4)?;
    let labels: String = row.get(5)?;
    let payload: String = row.get(6)?;
    let attempts: i64 = row.get(7)?;
    let status: String = row.get(8)?;
    let claim_deadline: Option<String> = row.get(9)?;
    let last_error: Option<String> = row.get(10)?;
    let enqueued_at: String = row.get(11)?;
    let last_attempt_at: Option<String> = row.get(12)?;

    let envelope = Envelope {
        spool_id: Some(spool_id),
        received_at: parse_ts(&received_at),
        event_ts: parse_ts(&event_ts),
        event_type,
        source,
        labels: serde_json::from_str(&labels).unwrap_or_default(),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        attempts: attempts as u32,
    };

    Ok(SpoolRecord {
        spool_id,
        envelope,
        status: parse_status(&status),
        claim_deadline: claim_deadline.map(|s| parse_ts(&s)),
        last_error,
        enqueued_at: parse_ts(&enqueued_at),
        last_attempt_at: last_attempt_at.map(|s| parse_ts(&s)),
    })
}

fn read_record(conn: &Connection, id: i64) -> Result<Option<SpoolRecord>, EdgeBotError> {
    conn.query_row(
        "SELECT spool_id, received_at, event_ts, event_type, source, labels, payload,
                attempts, status, claim_deadline, last_error, enqueued_at, last_attempt_at, byte_len
         FROM events WHERE spool_id = ?1",
        params![id],
        row_to_record,
    )
    .optional()
    .map_err(|e| EdgeBotError::Unavailable(format!("reading record {id}: {e}")))
}

fn export_dead_letter(dir: &Path, record: &SpoolRecord) {
    let name = format!("{}-{}.json", record.spool_id, record.envelope.event_type);
    let path = dir.join(name);
    if let Ok(json) = serde_json::to_vec_pretty(&record.envelope) {
        if let Err(e) = std::fs::write(&path, json) {
            warn!(path = %path.display(), error = %e, "failed writing dead-letter export");
        }
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn parse_status(s: &str) -> Status {
    match s {
        "pending" => Status::Pending,
        "in_flight" => Status::InFlight,
        "failed" => Status::Failed,
        "dead" => Status::Dead,
        _ => Status::Pending,
    }
}
