//! HTTP(S) sink: gzip JSON POST with bearer auth, mTLS, Retry-After (§4.5).

use std::io::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::Client;

use crate::config::TlsConfig;
use crate::error::EdgeBotError;
use crate::retry::classify_http_status;

use super::{OutboundBatch, Sink, WriteOutcome};

pub struct HttpSink {
    client: Client,
    url: String,
    auth_token: Option<String>,
    compression: bool,
}

impl HttpSink {
    pub fn new(
        url: String,
        auth_token: Option<String>,
        tls: &TlsConfig,
        compression: bool,
        timeout_ms: u64,
    ) -> Result<Self, EdgeBotError> {
        let mut builder = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .user_agent(format!("edgebot/{}", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!tls.verify);

        if let Some(ca_path) = &tls.ca_bundle {
            let pem = std::fs::read(ca_path)
                .map_err(|e| EdgeBotError::Config(format!("reading tls.ca_bundle: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| EdgeBotError::Config(format!("parsing tls.ca_bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert_path), Some(key_path)) = (&tls.client_cert, &tls.client_key) {
            let mut pem = std::fs::read(cert_path)
                .map_err(|e| EdgeBotError::Config(format!("reading tls.client_cert: {e}")))?;
            let mut key = std::fs::read(key_path)
                .map_err(|e| EdgeBotError::Config(format!("reading tls.client_key: {e}")))?;
            pem.append(&mut key);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| EdgeBotError::Config(format!("building client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| EdgeBotError::Config(format!("building http client: {e}")))?;

        Ok(Self { client, url, auth_token, compression })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn write(&self, batch: &OutboundBatch) -> WriteOutcome {
        let body = match serde_json::to_vec(batch) {
            Ok(b) => b,
            Err(e) => return WriteOutcome::Error(EdgeBotError::Permanent(format!("serializing batch: {e}")), None),
        };

        let (payload, content_encoding) = if self.compression {
            match gzip(&body) {
                Ok(gz) => (gz, Some("gzip")),
                Err(e) => return WriteOutcome::Error(EdgeBotError::Permanent(format!("gzip: {e}")), None),
            }
        } else {
            (body, None)
        };

        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("X-Edgebot-Batch-Size", batch.batch_size.to_string())
            .body(payload);

        if let Some(enc) = content_encoding {
            req = req.header("Content-Encoding", enc);
        }
        if let Some(token) = &self.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        if batch.is_retry {
            req = req.header("X-Retry", "true");
        }

        let resp = match req.send().await {
            Ok(r) => r,
            // Connection/TLS handshake failures (bad cert, refused TLS, unresolvable
            // host) won't heal with the same config on retry (§4.5, §7).
            Err(e) if e.is_connect() => {
                return WriteOutcome::Error(EdgeBotError::Permanent(e.to_string()), None)
            }
            Err(e) => return WriteOutcome::Error(EdgeBotError::Transient(e.to_string()), None),
        };

        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());

        if status.is_success() {
            WriteOutcome::Success(batch.batch_size)
        } else {
            let classification = classify_http_status(status.as_u16());
            let err = match classification {
                crate::retry::Classification::Permanent => {
                    EdgeBotError::Permanent(format!("http {status}"))
                }
                crate::retry::Classification::Transient => {
                    EdgeBotError::Transient(format!("http {status}"))
                }
            };
            WriteOutcome::Error(err, retry_after)
        }
    }
}

fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<f64> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(secs) = value.parse::<f64>() {
        return Some(secs);
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.num_milliseconds().max(0) as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_retry_after() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(120.0));
    }

    #[test]
    fn gzip_roundtrips() {
        let body = b"hello world".to_vec();
        let compressed = gzip(&body).unwrap();
        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, body);
    }
}
