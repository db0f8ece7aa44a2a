//! The durable spool: a single-writer, ordered queue between listeners and
//! the shipper (spec §4.1/§4.2/§6.5).

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::envelope::Envelope;
use crate::error::EdgeBotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InFlight,
    Failed,
    Dead,
}

/// An envelope plus the spool-private bookkeeping fields (spec §3.2).
#[derive(Debug, Clone)]
pub struct SpoolRecord {
    pub spool_id: i64,
    pub envelope: Envelope,
    pub status: Status,
    pub claim_deadline: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SpoolStats {
    pub pending: u64,
    pub in_flight: u64,
    pub failed: u64,
    pub dead: u64,
    pub total_bytes: u64,
}

/// The spool contract (spec §4.1). All operations are async so the sqlite
/// and in-memory backends share one call surface through the shipper.
#[async_trait]
pub trait Spool: Send + Sync {
    async fn enqueue(&self, envelope: Envelope) -> Result<i64, EdgeBotError>;

    async fn claim_batch(
        &self,
        max_count: usize,
        max_bytes: u64,
        lease_duration: chrono::Duration,
    ) -> Result<Vec<SpoolRecord>, EdgeBotError>;

    async fn commit(&self, spool_ids: &[i64]) -> Result<u64, EdgeBotError>;

    async fn fail(
        &self,
        spool_ids: &[i64],
        error: &str,
        permanent: bool,
    ) -> Result<(), EdgeBotError>;

    async fn stats(&self) -> Result<SpoolStats, EdgeBotError>;

    async fn reap_stale(&self) -> Result<u64, EdgeBotError>;
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_LAST_ERROR_BYTES: usize = 512;

pub fn truncate_error(msg: &str) -> String {
    if msg.len() <= DEFAULT_LAST_ERROR_BYTES {
        msg.to_string()
    } else {
        let mut end = DEFAULT_LAST_ERROR_BYTES;
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &msg[..end])
    }
}
