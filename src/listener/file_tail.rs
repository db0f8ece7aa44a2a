//! Pull-style file tailer: polls a file's length, enqueues new trailing
//! lines, doubles its poll interval (capped) on backpressure (spec §C.5, §5).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tracing::warn;

use crate::envelope::{Envelope, Labels};
use crate::error::EdgeBotError;
use crate::listener::EnqueueHandle;

const MIN_POLL: Duration = Duration::from_millis(500);
const MAX_POLL: Duration = Duration::from_secs(30);

pub struct FileTailListener {
    path: PathBuf,
    healthy: AtomicBool,
}

impl FileTailListener {
    pub fn new(path: PathBuf) -> Self {
        Self { path, healthy: AtomicBool::new(false) }
    }
}

#[async_trait::async_trait]
impl super::Listener for FileTailListener {
    fn name(&self) -> &str {
        "file_tail"
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn run(&self, enqueue: Arc<EnqueueHandle>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let source = format!("file:{}", self.path.display());
        let mut poll_interval = MIN_POLL;
        let mut offset: u64 = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m.len(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "file_tail could not stat file at startup");
                0
            }
        };
        self.healthy.store(true, Ordering::Relaxed);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
            if *shutdown.borrow() {
                return;
            }

            match self.read_new_lines(offset).await {
                Ok((lines, new_offset)) => {
                    offset = new_offset;
                    let mut backpressured = false;
                    for line in lines {
                        let envelope = Envelope {
                            spool_id: None,
                            received_at: Utc::now(),
                            event_ts: Utc::now(),
                            event_type: "log_file".to_string(),
                            source: source.clone(),
                            labels: Labels::new(),
                            payload: serde_json::json!({ "line": line }),
                            attempts: 0,
                        };
                        if let Err(EdgeBotError::CapacityExceeded) = enqueue.enqueue(envelope).await {
                            backpressured = true;
                            break;
                        }
                    }
                    poll_interval = if backpressured {
                        (poll_interval * 2).min(MAX_POLL)
                    } else {
                        MIN_POLL
                    };
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "file_tail read error");
                    poll_interval = (poll_interval * 2).min(MAX_POLL);
                }
            }
        }
    }
}

impl FileTailListener {
    async fn read_new_lines(&self, offset: u64) -> std::io::Result<(Vec<String>, u64)> {
        let mut file = File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        if len < offset {
            // File was truncated/rotated; restart from the beginning.
            return self.read_from(&mut file, 0).await;
        }
        self.read_from(&mut file, offset).await
    }

    async fn read_from(&self, file: &mut File, from: u64) -> std::io::Result<(Vec<String>, u64)> {
        file.seek(SeekFrom::Start(from)).await?;
        let mut reader = BufReader::new(file);
        let mut lines = Vec::new();
        let mut consumed: u64 = from;
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                break;
            }
            consumed += n as u64;
            if line.ends_with('\n') {
                lines.push(line.trim_end_matches(['\r', '\n']).to_string());
            } else {
                // partial trailing line; leave it for next poll by not advancing past it
                consumed -= n as u64;
                break;
            }
        }
        Ok((lines, consumed))
    }
}
