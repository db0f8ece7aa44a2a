//! Sink contract and the outbound batch envelope (spec §3.3, §4.5-4.6).

pub mod file;
pub mod http;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use crate::envelope::Envelope;
use crate::error::EdgeBotError;
use crate::spool::SpoolRecord;

/// A single message as it appears on the wire: every envelope field except
/// `spool_id`, `attempts`, and any `__`-prefixed key (§3.3, P8).
#[derive(Debug, Serialize)]
pub struct SanitizedMessage {
    pub received_at: chrono::DateTime<Utc>,
    pub event_ts: chrono::DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub labels: crate::envelope::Labels,
    pub payload: serde_json::Value,
}

impl From<&Envelope> for SanitizedMessage {
    fn from(env: &Envelope) -> Self {
        let payload = strip_dunder_keys(&env.payload);
        Self {
            received_at: env.received_at,
            event_ts: env.event_ts,
            event_type: env.event_type.clone(),
            source: env.source.clone(),
            labels: env.labels.clone(),
            payload,
        }
    }
}

fn strip_dunder_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let cleaned: serde_json::Map<String, serde_json::Value> = map
                .iter()
                .filter(|(k, _)| !k.starts_with("__"))
                .map(|(k, v)| (k.clone(), strip_dunder_keys(v)))
                .collect();
            serde_json::Value::Object(cleaned)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(strip_dunder_keys).collect())
        }
        other => other.clone(),
    }
}

#[derive(Debug, Serialize)]
pub struct OutboundBatch {
    pub messages: Vec<SanitizedMessage>,
    pub batch_size: usize,
    pub timestamp: i64,
    pub source: String,
    pub is_retry: bool,
}

impl OutboundBatch {
    pub fn from_records(records: &[SpoolRecord], node_source: &str) -> Self {
        let is_retry = records.iter().any(|r| r.envelope.attempts > 0);
        let messages = records.iter().map(|r| SanitizedMessage::from(&r.envelope)).collect::<Vec<_>>();
        Self {
            batch_size: messages.len(),
            messages,
            timestamp: Utc::now().timestamp(),
            source: node_source.to_string(),
            is_retry,
        }
    }
}

/// Result of a single sink write, already classified by the retry policy.
pub enum WriteOutcome {
    Success(usize),
    Error(EdgeBotError, Option<f64>),
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    async fn write(&self, batch: &OutboundBatch) -> WriteOutcome;
}
