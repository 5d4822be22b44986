//! Raw event sources
//!
//! A source yields raw JSON lines in best-effort bounded batches; it never
//! promises exactly `max` lines.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::time::sleep;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

#[async_trait]
pub trait EventSource: Send {
    /// Up to `max` raw records, or `None` once the source is exhausted.
    async fn next_batch(&mut self, max: usize) -> std::io::Result<Option<Vec<String>>>;
}

/// Newline-delimited JSON from a file or stdin.
///
/// With `follow` set, end of file means "wait for more" (like `tail -f`),
/// and a rotated file is reopened from its start.
pub struct JsonlSource {
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    path: Option<PathBuf>,
    inode: Option<u64>,
    follow: bool,
    poll_interval: Duration,
}

impl JsonlSource {
    pub async fn open(path: PathBuf, follow: bool) -> std::io::Result<Self> {
        let (reader, inode) = Self::open_file(&path).await?;
        log::info!("📖 Reading events from: {}{}", path.display(), if follow { " (follow)" } else { "" });
        Ok(Self {
            reader,
            path: Some(path),
            inode,
            follow,
            poll_interval: Duration::from_millis(100),
        })
    }

    pub fn stdin() -> Self {
        log::info!("📖 Reading events from stdin");
        Self {
            reader: Box::new(BufReader::new(tokio::io::stdin())),
            path: None,
            inode: None,
            follow: false,
            poll_interval: Duration::from_millis(100),
        }
    }

    async fn open_file(
        path: &PathBuf,
    ) -> std::io::Result<(Box<dyn AsyncBufRead + Unpin + Send>, Option<u64>)> {
        let file = File::open(path).await?;
        #[cfg(unix)]
        let inode = Some(file.metadata().await?.ino());
        #[cfg(not(unix))]
        let inode = None;
        Ok((Box::new(BufReader::new(file)), inode))
    }

    /// Detect if the file has been rotated (inode changed).
    ///
    /// Takes owned state so no borrow of the (non-`Sync`) reader lives across the await.
    async fn detect_rotation(path: Option<PathBuf>, inode: Option<u64>) -> std::io::Result<bool> {
        #[cfg(unix)]
        {
            let Some(path) = path else {
                return Ok(false);
            };
            match tokio::fs::metadata(&path).await {
                Ok(metadata) => Ok(inode.map_or(false, |old| old != metadata.ino())),
                // Mid-rotation: old file gone, new one not created yet.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = (path, inode);
            Ok(false)
        }
    }
}

#[async_trait]
impl EventSource for JsonlSource {
    async fn next_batch(&mut self, max: usize) -> std::io::Result<Option<Vec<String>>> {
        let max = max.max(1);
        let mut batch = Vec::new();

        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line).await?;

            if read > 0 {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    batch.push(trimmed.to_string());
                    if batch.len() >= max {
                        return Ok(Some(batch));
                    }
                }
                continue;
            }

            // End of currently available input.
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
            if !self.follow {
                return Ok(None);
            }

            if Self::detect_rotation(self.path.clone(), self.inode).await? {
                if let Some(path) = self.path.clone() {
                    log::info!("🔄 File rotation detected, reopening: {}", path.display());
                    let (reader, inode) = Self::open_file(&path).await?;
                    self.reader = reader;
                    self.inode = inode;
                    continue;
                }
            }
            sleep(self.poll_interval).await;
        }
    }
}

/// In-memory source, mostly for tests and replays assembled in code.
pub struct VecSource {
    lines: VecDeque<String>,
}

impl VecSource {
    pub fn new(lines: impl IntoIterator<Item = String>) -> Self {
        Self {
            lines: lines.into_iter().collect(),
        }
    }
}

#[async_trait]
impl EventSource for VecSource {
    async fn next_batch(&mut self, max: usize) -> std::io::Result<Option<Vec<String>>> {
        if self.lines.is_empty() {
            return Ok(None);
        }
        let n = max.max(1).min(self.lines.len());
        Ok(Some(self.lines.drain(..n).collect()))
    }
}
