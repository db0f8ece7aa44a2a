//! The uniform event envelope and its normalization contract (spec §3.1).

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Upper bound on a serialized payload before truncation kicks in.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Upper bound on a label key or value, in bytes.
pub const MAX_LABEL_BYTES: usize = 128;

/// Default clamp window between `event_ts` and `received_at`.
pub const DEFAULT_CLOCK_SKEW_BOUND: ChronoDuration = ChronoDuration::hours(24);

/// One of the fixed event kinds listed in spec §3.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Syslog,
    SnmpMetric,
    Weather,
    LogFile,
    Nmea,
    Flow,
    HostServiceInventory,
    Other,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Syslog => "syslog",
            EventType::SnmpMetric => "snmp_metric",
            EventType::Weather => "weather",
            EventType::LogFile => "log_file",
            EventType::Nmea => "nmea",
            EventType::Flow => "flow",
            EventType::HostServiceInventory => "host_service_inventory",
            EventType::Other => "other",
        }
    }
}

/// Small, bounded string->string mapping: host/service/severity/site/env.
pub type Labels = BTreeMap<String, String>;

/// The event envelope. `spool_id` is assigned by the spool on enqueue and is
/// never present in the outbound representation (see `sinks::Sanitized`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spool_id: Option<i64>,
    pub received_at: DateTime<Utc>,
    pub event_ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub labels: Labels,
    pub payload: Json,
    #[serde(default)]
    pub attempts: u32,
}

/// Restricted character set for `type`, `source`, and `labels.severity`: `[a-z0-9_.-]`.
fn is_restricted_charset(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
}

fn sanitize_restricted(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_uppercase() {
                c.to_ascii_lowercase()
            } else {
                c
            }
        })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
        .collect();
    if cleaned.is_empty() {
        "other".to_string()
    } else {
        cleaned
    }
}

/// Outcome of normalizing a freshly-produced envelope, reported back to the
/// caller so it can bump the right metric counters.
#[derive(Debug, Default)]
pub struct NormalizationReport {
    pub clock_skew_clamped: bool,
    pub payload_truncated: bool,
}

/// Applies spec §3.1's invariants in place: clamps `event_ts`, truncates an
/// oversized `payload`, restricts the charset of `type`/`source`/`severity`,
/// and bounds label key/value lengths.
pub fn normalize(env: &mut Envelope, clock_skew_bound: ChronoDuration) -> NormalizationReport {
    let mut report = NormalizationReport::default();

    let skew_limit = env.received_at + clock_skew_bound;
    if env.event_ts > skew_limit {
        env.event_ts = env.received_at;
        report.clock_skew_clamped = true;
    }

    if !is_restricted_charset(&env.event_type) {
        env.event_type = sanitize_restricted(&env.event_type);
    }
    if !is_restricted_charset(&env.source) {
        env.source = sanitize_restricted(&env.source);
    }
    if let Some(sev) = env.labels.get("severity").cloned() {
        if !is_restricted_charset(&sev) {
            env.labels.insert("severity".to_string(), sanitize_restricted(&sev));
        }
    }

    let mut bounded_labels = Labels::new();
    for (k, v) in env.labels.iter() {
        let k = truncate_bytes(k, MAX_LABEL_BYTES);
        let v = truncate_bytes(v, MAX_LABEL_BYTES);
        bounded_labels.insert(k, v);
    }
    env.labels = bounded_labels;

    if let Ok(serialized) = serde_json::to_vec(&env.payload) {
        if serialized.len() > MAX_PAYLOAD_BYTES {
            let hash = sha256_hex(&serialized);
            env.payload = serde_json::json!({
                "__truncated": true,
                "__original_sha256": hash,
                "__original_bytes": serialized.len(),
            });
            report.payload_truncated = true;
        }
    }

    report
}

fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
