//! Follow a growing log file from its current end.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, info, warn};

/// Longest line buffered in memory. Longer lines are discarded up to their
/// newline.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailLine {
    /// A complete line, newline included.
    Complete(String),
    /// A line over [`MAX_LINE_BYTES`] that was dropped; carries its length.
    Oversized(usize),
}

pub struct Tailer {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    pending: Vec<u8>,
    /// Bytes of the current oversized line dropped so far.
    discarded: Option<usize>,
}

impl Tailer {
    /// Open `path` positioned at its end; existing content is never replayed.
    pub async fn open_at_end(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .await
            .with_context(|| format!("failed to open log source: {}", path.display()))?;
        let offset = file
            .seek(SeekFrom::End(0))
            .await
            .with_context(|| format!("failed to seek log source: {}", path.display()))?;
        debug!(path = %path.display(), offset, "tailing from end of file");
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            offset,
            pending: Vec::new(),
            discarded: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the next complete line, or `None` when no complete line is
    /// available yet. A partial trailing line is held back until its newline
    /// arrives. At most [`MAX_LINE_BYTES`] are held for one line.
    pub async fn next_line(&mut self) -> Result<Option<TailLine>> {
        loop {
            let buf = self
                .reader
                .fill_buf()
                .await
                .with_context(|| format!("failed to read log source: {}", self.path.display()))?;
            if buf.is_empty() {
                self.check_rotation().await?;
                return Ok(None);
            }

            let (len, complete) = match buf.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (buf.len(), false),
            };
            match self.discarded {
                Some(dropped) => self.discarded = Some(dropped + len),
                None if self.pending.len() + len > MAX_LINE_BYTES => {
                    warn!(
                        path = %self.path.display(),
                        limit = MAX_LINE_BYTES,
                        "log line exceeds length limit, discarding"
                    );
                    self.discarded = Some(self.pending.len() + len);
                    self.pending.clear();
                }
                None => self.pending.extend_from_slice(&buf[..len]),
            }
            self.reader.consume(len);
            self.offset += len as u64;

            if complete {
                if let Some(dropped) = self.discarded.take() {
                    return Ok(Some(TailLine::Oversized(dropped)));
                }
                let line = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                return Ok(Some(TailLine::Complete(line)));
            }
        }
    }

    /// Reopen from the start if the file was truncated or replaced.
    async fn check_rotation(&mut self) -> Result<()> {
        let on_disk = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            // Between rotate and recreate; try again next poll.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to stat {}", self.path.display()))
            }
        };

        let truncated = on_disk.len() < self.offset;
        let replaced = is_replaced(&on_disk, &self.reader.get_ref().metadata().await?);
        if !(truncated || replaced) {
            return Ok(());
        }

        info!(path = %self.path.display(), truncated, replaced, "log source rotated, reopening");
        let file = File::open(&self.path)
            .await
            .with_context(|| format!("failed to reopen log source: {}", self.path.display()))?;
        self.reader = BufReader::new(file);
        self.offset = 0;
        self.pending.clear();
        self.discarded = None;
        Ok(())
    }
}

#[cfg(unix)]
fn is_replaced(on_disk: &std::fs::Metadata, open: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    on_disk.ino() != open.ino() || on_disk.dev() != open.dev()
}

#[cfg(not(unix))]
fn is_replaced(_on_disk: &std::fs::Metadata, _open: &std::fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    async fn next(tailer: &mut Tailer) -> Option<String> {
        match tailer.next_line().await.unwrap() {
            Some(TailLine::Complete(line)) => Some(line),
            Some(TailLine::Oversized(n)) => panic!("unexpected oversized line of {n} bytes"),
            None => None,
        }
    }

    #[tokio::test]
    async fn test_starts_at_end() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "old line 1\nold line 2\n").unwrap();

        let mut tailer = Tailer::open_at_end(&path).await.unwrap();
        assert_eq!(next(&mut tailer).await, None);

        append(&path, "new line\n");
        assert_eq!(next(&mut tailer).await.as_deref(), Some("new line\n"));
        assert_eq!(next(&mut tailer).await, None);
    }

    #[tokio::test]
    async fn test_partial_line_is_held_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();

        let mut tailer = Tailer::open_at_end(&path).await.unwrap();
        append(&path, "half a ");
        assert_eq!(next(&mut tailer).await, None);
        append(&path, "line\n");
        assert_eq!(next(&mut tailer).await.as_deref(), Some("half a line\n"));
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_top() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "a long line that sets the offset\n").unwrap();

        let mut tailer = Tailer::open_at_end(&path).await.unwrap();
        std::fs::write(&path, "").unwrap();
        assert_eq!(next(&mut tailer).await, None);

        append(&path, "fresh\n");
        assert_eq!(next(&mut tailer).await.as_deref(), Some("fresh\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replaced_file_is_followed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "before rotate\n").unwrap();

        let mut tailer = Tailer::open_at_end(&path).await.unwrap();
        std::fs::rename(&path, dir.path().join("access.log.1")).unwrap();
        std::fs::write(&path, "after rotate, longer than before\n").unwrap();

        assert_eq!(next(&mut tailer).await, None);
        assert_eq!(
            next(&mut tailer).await.as_deref(),
            Some("after rotate, longer than before\n")
        );
    }

    #[tokio::test]
    async fn test_oversized_line_is_dropped() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();

        let mut tailer = Tailer::open_at_end(&path).await.unwrap();
        let long = "x".repeat(MAX_LINE_BYTES + 10);
        append(&path, &long);
        assert_eq!(tailer.next_line().await.unwrap(), None);
        assert!(tailer.pending.is_empty());

        append(&path, "tail of the long one\nnext\n");
        assert_eq!(
            tailer.next_line().await.unwrap(),
            Some(TailLine::Oversized(MAX_LINE_BYTES + 10 + "tail of the long one\n".len()))
        );
        assert_eq!(next(&mut tailer).await.as_deref(), Some("next\n"));
    }

    #[tokio::test]
    async fn test_line_at_limit_is_kept() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();

        let mut tailer = Tailer::open_at_end(&path).await.unwrap();
        let line = format!("{}\n", "y".repeat(MAX_LINE_BYTES - 1));
        append(&path, &line);
        assert_eq!(next(&mut tailer).await, Some(line));
    }
}
