//! Lossy UDP syslog listener: wraps each datagram as `type=syslog`,
//! drop-and-count on backpressure (spec §C.5, §5 backpressure policy).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::net::UdpSocket;
use tracing::warn;

use crate::envelope::{Envelope, Labels};
use crate::error::EdgeBotError;
use crate::listener::EnqueueHandle;
use crate::metrics::Metrics;

const MAX_DATAGRAM: usize = 65_535;

pub struct SyslogUdpListener {
    bind: String,
    metrics: Arc<Metrics>,
    healthy: AtomicBool,
}

impl SyslogUdpListener {
    pub fn new(bind: String, metrics: Arc<Metrics>) -> Self {
        Self { bind, metrics, healthy: AtomicBool::new(false) }
    }
}

#[async_trait::async_trait]
impl super::Listener for SyslogUdpListener {
    fn name(&self) -> &str {
        "syslog_udp"
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn run(&self, enqueue: Arc<EnqueueHandle>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let socket = match UdpSocket::bind(&self.bind).await {
            Ok(s) => s,
            Err(e) => {
                warn!(bind = %self.bind, error = %e, "syslog_udp failed to bind");
                self.healthy.store(false, Ordering::Relaxed);
                return;
            }
        };
        self.healthy.store(true, Ordering::Relaxed);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, _addr)) => {
                            let raw = String::from_utf8_lossy(&buf[..n]).to_string();
                            let envelope = Envelope {
                                spool_id: None,
                                received_at: Utc::now(),
                                event_ts: Utc::now(),
                                event_type: "syslog".to_string(),
                                source: "syslog_udp".to_string(),
                                labels: Labels::new(),
                                payload: serde_json::json!({ "raw": raw }),
                                attempts: 0,
                            };
                            if let Err(EdgeBotError::CapacityExceeded) = enqueue.enqueue(envelope).await {
                                self.metrics.event_dropped("syslog_udp", "spool_full");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "syslog_udp recv error");
                        }
                    }
                }
            }
        }
    }
}
