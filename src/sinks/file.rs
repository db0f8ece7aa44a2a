//! File sink: writes readable + gzipped payload atomically to a directory (§4.6, §6.2).

use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;

use crate::error::EdgeBotError;

use super::{OutboundBatch, Sink, WriteOutcome};

pub struct FileSink {
    dir: PathBuf,
    compression: bool,
}

impl FileSink {
    pub fn new(url: &str, compression: bool) -> Result<Self, EdgeBotError> {
        let dir = url
            .strip_prefix("file://")
            .ok_or_else(|| EdgeBotError::Config(format!("not a file:// url: {url}")))?;
        let dir = PathBuf::from(dir);
        if !dir.is_dir() {
            return Err(EdgeBotError::Config(format!("file sink directory does not exist: {}", dir.display())));
        }
        Ok(Self { dir, compression })
    }
}

fn short_hex() -> String {
    let n: u32 = rand::rng().random_range(0..0xFFFFFF);
    format!("{n:06x}")
}

fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn write(&self, batch: &OutboundBatch) -> WriteOutcome {
        let json = match serde_json::to_vec(batch) {
            Ok(b) => b,
            Err(e) => return WriteOutcome::Error(EdgeBotError::Permanent(format!("serializing batch: {e}")), None),
        };

        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let base = format!("payload-{stamp}-{}", short_hex());
        let json_path = self.dir.join(format!("{base}.json"));
        let gz_path = self.dir.join(format!("{base}.json.gz"));

        if let Err(e) = atomic_write(&json_path, &json) {
            return WriteOutcome::Error(classify_io_error(e), None);
        }

        if self.compression {
            let gz = match gzip(&json) {
                Ok(g) => g,
                Err(e) => return WriteOutcome::Error(classify_io_error(e), None),
            };
            if let Err(e) = atomic_write(&gz_path, &gz) {
                return WriteOutcome::Error(classify_io_error(e), None);
            }
        }

        WriteOutcome::Success(batch.batch_size)
    }
}

fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

fn classify_io_error(e: std::io::Error) -> EdgeBotError {
    match e.kind() {
        ErrorKind::StorageFull | ErrorKind::QuotaExceeded => EdgeBotError::Permanent(e.to_string()),
        _ => EdgeBotError::Transient(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::SpoolRecord;

    fn batch() -> OutboundBatch {
        let records: Vec<SpoolRecord> = Vec::new();
        OutboundBatch::from_records(&records, "test-node")
    }

    #[tokio::test]
    async fn writes_json_and_gz_sibling_with_identical_uncompressed_content() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(&format!("file://{}", dir.path().display()), true).unwrap();
        let outcome = sink.write(&batch()).await;
        assert!(matches!(outcome, WriteOutcome::Success(_)));

        let mut json_path = None;
        let mut gz_path = None;
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().map(|e| e == "gz").unwrap_or(false) {
                gz_path = Some(path);
            } else if path.extension().map(|e| e == "json").unwrap_or(false) {
                json_path = Some(path);
            }
        }
        let json_path = json_path.expect("json file written");
        let gz_path = gz_path.expect("gz file written");

        let json_bytes = std::fs::read(&json_path).unwrap();
        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(std::fs::File::open(&gz_path).unwrap());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(json_bytes, decompressed);
    }

    #[test]
    fn rejects_missing_directory() {
        let err = FileSink::new("file:///nonexistent/path/does/not/exist", true);
        assert!(err.is_err());
    }
}
