//! In-memory-only spool for ephemeral deployments (spec §4.1). Same
//! operations as the durable backend, no persistence across restart.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use crate::envelope::Envelope;
use crate::error::EdgeBotError;

use super::{truncate_error, Spool, SpoolRecord, SpoolStats, Status, DEFAULT_MAX_ATTEMPTS};

struct Inner {
    records: BTreeMap<i64, SpoolRecord>,
    next_id: i64,
}

pub struct MemorySpool {
    inner: Mutex<Inner>,
    max_bytes: u64,
    max_attempts: u32,
}

impl MemorySpool {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner { records: BTreeMap::new(), next_id: 1 }),
            max_bytes,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

fn record_bytes(rec: &SpoolRecord) -> u64 {
    serde_json::to_vec(&rec.envelope.payload).map(|v| v.len() as u64).unwrap_or(0)
}

#[async_trait]
impl Spool for MemorySpool {
    async fn enqueue(&self, envelope: Envelope) -> Result<i64, EdgeBotError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let spool_id = inner.next_id;

        let mut envelope = envelope;
        envelope.spool_id = Some(spool_id);
        let candidate = SpoolRecord {
            spool_id,
            envelope,
            status: Status::Pending,
            claim_deadline: None,
            last_error: None,
            enqueued_at: now,
            last_attempt_at: None,
        };

        let current_bytes: u64 = inner.records.values().map(record_bytes).sum();
        if current_bytes + record_bytes(&candidate) > self.max_bytes {
            return Err(EdgeBotError::CapacityExceeded);
        }

        inner.next_id += 1;
        inner.records.insert(spool_id, candidate);
        Ok(spool_id)
    }

    async fn claim_batch(
        &self,
        max_count: usize,
        max_bytes: u64,
        lease_duration: ChronoDuration,
    ) -> Result<Vec<SpoolRecord>, EdgeBotError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let deadline = now + lease_duration;

        let eligible_ids: Vec<i64> = inner
            .records
            .iter()
            .filter(|(_, r)| {
                r.status == Status::Pending
                    || (r.status == Status::InFlight && r.claim_deadline.map(|d| d < now).unwrap_or(false))
            })
            .map(|(id, _)| *id)
            .collect();

        let mut picked = Vec::new();
        let mut byte_total = 0u64;
        for id in eligible_ids {
            if picked.len() >= max_count {
                break;
            }
            let rec_bytes = record_bytes(&inner.records[&id]);
            if !picked.is_empty() && byte_total + rec_bytes > max_bytes {
                break;
            }
            byte_total += rec_bytes;
            picked.push(id);
        }

        let mut out = Vec::with_capacity(picked.len());
        for id in picked {
            let rec = inner.records.get_mut(&id).unwrap();
            rec.status = Status::InFlight;
            rec.claim_deadline = Some(deadline);
            out.push(rec.clone());
        }
        Ok(out)
    }

    async fn commit(&self, spool_ids: &[i64]) -> Result<u64, EdgeBotError> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0u64;
        for id in spool_ids {
            if inner.records.remove(id).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn fail(&self, spool_ids: &[i64], error: &str, permanent: bool) -> Result<(), EdgeBotError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let error = truncate_error(error);
        let max_attempts = self.max_attempts;
        for id in spool_ids {
            if let Some(rec) = inner.records.get_mut(id) {
                rec.envelope.attempts += 1;
                rec.last_error = Some(error.clone());
                rec.last_attempt_at = Some(now);
                rec.claim_deadline = None;
                rec.status = if permanent || rec.envelope.attempts >= max_attempts {
                    Status::Dead
                } else {
                    Status::Pending
                };
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<SpoolStats, EdgeBotError> {
        let inner = self.inner.lock().unwrap();
        let mut stats = SpoolStats::default();
        for rec in inner.records.values() {
            stats.total_bytes += record_bytes(rec);
            match rec.status {
                Status::Pending => stats.pending += 1,
                Status::InFlight => stats.in_flight += 1,
                Status::Failed => stats.failed += 1,
                Status::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }

    async fn reap_stale(&self) -> Result<u64, EdgeBotError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut reaped = 0u64;
        for rec in inner.records.values_mut() {
            if rec.status == Status::InFlight && rec.claim_deadline.map(|d| d < now).unwrap_or(false) {
                rec.status = Status::Pending;
                rec.claim_deadline = None;
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}
