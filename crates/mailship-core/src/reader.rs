//! Batched log reading with durable bookmarks.
//!
//! The shipper pulls one batch, flushes it, and only then acknowledges the
//! batch's end position with [`LineSource::advance`]. [`FileLineSource`]
//! persists that position to a bookmark file, so after a restart reading
//! resumes at the first unacknowledged line.

use std::fs;
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::config::ReaderConfig;
use crate::error::ReaderError;

/// Upper bound on bytes read per batch.
const MAX_CHUNK: u64 = 4 * 1024 * 1024;

/// Acknowledged read position in a log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub file: PathBuf,
    /// Byte offset of the first unacknowledged line
    pub offset: u64,
    /// Lines consumed before `offset`
    pub lines: u64,
}

/// One batch of complete lines and the position just past them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBatch {
    pub lines: Vec<String>,
    pub position: Bookmark,
}

/// Upstream producer of log lines.
#[allow(async_fn_in_trait)]
pub trait LineSource {
    /// Next batch, or `None` once the source is exhausted.
    async fn next_batch(&mut self) -> Result<Option<LineBatch>, ReaderError>;

    /// Acknowledge everything up to `position`.
    async fn advance(&mut self, position: &Bookmark) -> Result<(), ReaderError>;
}

/// Reads a log file in batches of at most `batch_limit` complete lines.
#[derive(Debug)]
pub struct FileLineSource {
    path: PathBuf,
    bookmark_path: PathBuf,
    batch_limit: usize,
    follow: bool,
    poll_interval: Duration,
    /// Read position; ahead of the bookmark while a batch is unacknowledged
    offset: u64,
    lines: u64,
}

impl FileLineSource {
    /// Open `config.file`, resuming from its bookmark under `bookmark_dir`.
    pub fn open(config: &ReaderConfig, bookmark_dir: &Path) -> Result<Self, ReaderError> {
        let path = config.file.clone();
        let bookmark_path = bookmark_path_for(bookmark_dir, &path);
        let mut source = Self {
            path,
            bookmark_path,
            batch_limit: config.batch_limit.max(1),
            follow: config.follow,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            offset: 0,
            lines: 0,
        };

        if let Some(bookmark) = load_bookmark(&source.bookmark_path)? {
            if bookmark.file == source.path {
                info!(
                    file = %source.path.display(),
                    offset = bookmark.offset,
                    lines = bookmark.lines,
                    "Resuming from bookmark"
                );
                source.offset = bookmark.offset;
                source.lines = bookmark.lines;
            } else {
                warn!(
                    bookmark = %source.bookmark_path.display(),
                    recorded = %bookmark.file.display(),
                    "Bookmark belongs to another file; starting from the beginning"
                );
            }
        }
        Ok(source)
    }

    #[must_use]
    pub fn bookmark_path(&self) -> &Path {
        &self.bookmark_path
    }

    /// Current (possibly unacknowledged) read position.
    #[must_use]
    pub fn position(&self) -> Bookmark {
        Bookmark {
            file: self.path.clone(),
            offset: self.offset,
            lines: self.lines,
        }
    }

    fn io_err(&self, source: std::io::Error) -> ReaderError {
        ReaderError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Read whatever complete lines are available now.
    async fn read_available(&mut self) -> Result<Option<LineBatch>, ReaderError> {
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        let len = file.metadata().await.map_err(|e| self.io_err(e))?.len();

        if len < self.offset {
            warn!(
                file = %self.path.display(),
                offset = self.offset,
                len,
                "Log file shrank; assuming rotation and restarting at offset 0"
            );
            self.offset = 0;
            self.lines = 0;
        }
        if len == self.offset {
            return Ok(None);
        }

        let want = (len - self.offset).min(MAX_CHUNK);
        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|e| self.io_err(e))?;
        let mut buf = Vec::with_capacity(usize::try_from(want).unwrap_or(0));
        (&mut file)
            .take(want)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| self.io_err(e))?;

        let (lines, consumed, count) = split_lines(&buf, self.batch_limit, want == MAX_CHUNK);
        if consumed == 0 {
            return Ok(None);
        }

        self.offset += consumed as u64;
        self.lines += count as u64;
        debug!(
            file = %self.path.display(),
            lines = lines.len(),
            offset = self.offset,
            "Read batch"
        );
        Ok(Some(LineBatch {
            lines,
            position: self.position(),
        }))
    }
}

/// Split up to `limit` newline-terminated lines off `buf`. A trailing
/// partial line is left unread unless `force_partial` is set and no
/// newline exists at all. Returns the non-blank lines, bytes consumed and
/// lines consumed (blank ones included).
fn split_lines(buf: &[u8], limit: usize, force_partial: bool) -> (Vec<String>, usize, usize) {
    let mut lines = Vec::new();
    let mut consumed = 0;
    let mut count = 0;

    for raw in buf.split_inclusive(|b| *b == b'\n') {
        if count >= limit || raw.last() != Some(&b'\n') {
            break;
        }
        consumed += raw.len();
        count += 1;
        let text = String::from_utf8_lossy(raw);
        let text = text.trim_end_matches(['\n', '\r']);
        if !text.trim().is_empty() {
            lines.push(text.to_string());
        }
    }

    if count == 0 && force_partial && !buf.is_empty() {
        lines.push(String::from_utf8_lossy(buf).into_owned());
        return (lines, buf.len(), 1);
    }
    (lines, consumed, count)
}

fn bookmark_path_for(dir: &Path, file: &Path) -> PathBuf {
    let name = file
        .file_name()
        .map_or_else(|| "log".to_string(), |n| n.to_string_lossy().into_owned());
    dir.join(format!("{name}.json"))
}

fn load_bookmark(path: &Path) -> Result<Option<Bookmark>, ReaderError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ReaderError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| ReaderError::Bookmark {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Write `bookmark` to a temp file, sync it, then rename over `path`.
fn store_bookmark(path: &Path, bookmark: &Bookmark) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec(bookmark).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&json)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}

impl LineSource for FileLineSource {
    async fn next_batch(&mut self) -> Result<Option<LineBatch>, ReaderError> {
        loop {
            if let Some(batch) = self.read_available().await? {
                return Ok(Some(batch));
            }
            if !self.follow {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn advance(&mut self, position: &Bookmark) -> Result<(), ReaderError> {
        store_bookmark(&self.bookmark_path, position).map_err(|source| ReaderError::Io {
            path: self.bookmark_path.clone(),
            source,
        })
    }
}

/// Lines held in memory, served in batches. Acknowledgements are recorded
/// but not persisted.
#[derive(Debug, Clone)]
pub struct VecLineSource {
    label: PathBuf,
    lines: Vec<String>,
    batch_limit: usize,
    cursor: usize,
    acknowledged: Vec<Bookmark>,
}

impl VecLineSource {
    /// `label` names the source in bookmarks.
    pub fn new(label: impl Into<PathBuf>, lines: Vec<String>, batch_limit: usize) -> Self {
        Self {
            label: label.into(),
            lines,
            batch_limit: batch_limit.max(1),
            cursor: 0,
            acknowledged: Vec::new(),
        }
    }

    /// Split `text` into lines, dropping blank ones.
    pub fn from_text(label: impl Into<PathBuf>, text: &str, batch_limit: usize) -> Self {
        let lines = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        Self::new(label, lines, batch_limit)
    }

    #[must_use]
    pub fn acknowledged(&self) -> &[Bookmark] {
        &self.acknowledged
    }
}

impl LineSource for VecLineSource {
    async fn next_batch(&mut self) -> Result<Option<LineBatch>, ReaderError> {
        if self.cursor >= self.lines.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_limit).min(self.lines.len());
        let lines = self.lines[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Some(LineBatch {
            lines,
            position: Bookmark {
                file: self.label.clone(),
                offset: end as u64,
                lines: end as u64,
            },
        }))
    }

    async fn advance(&mut self, position: &Bookmark) -> Result<(), ReaderError> {
        self.acknowledged.push(position.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn setup(content: &str, batch_limit: usize) -> (TempDir, ReaderConfig, PathBuf) {
        let dir = tempdir().unwrap();
        let file = dir.path().join("maillog");
        fs::write(&file, content).unwrap();
        let config = ReaderConfig {
            file,
            batch_limit,
            follow: false,
            poll_interval_ms: 10,
        };
        let bookmarks = dir.path().join(".bookmark");
        (dir, config, bookmarks)
    }

    #[test]
    fn split_leaves_partial_line() {
        let (lines, consumed, count) = split_lines(b"a\nb\npart", 10, false);
        assert_eq!(lines, ["a", "b"]);
        assert_eq!(consumed, 4);
        assert_eq!(count, 2);
    }

    #[test]
    fn split_respects_limit_and_skips_blank() {
        let (lines, consumed, count) = split_lines(b"a\r\n\nb\nc\n", 3, false);
        assert_eq!(lines, ["a", "b"]);
        assert_eq!(consumed, 6);
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn reads_in_batches_then_stops() {
        let (_dir, config, bookmarks) = setup("l1\nl2\nl3\n", 2);
        let mut source = FileLineSource::open(&config, &bookmarks).unwrap();
        let first = source.next_batch().await.unwrap().unwrap();
        assert_eq!(first.lines, ["l1", "l2"]);
        assert_eq!(first.position.offset, 6);
        let second = source.next_batch().await.unwrap().unwrap();
        assert_eq!(second.lines, ["l3"]);
        assert_eq!(second.position.lines, 3);
        assert!(source.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resumes_from_acknowledged_position_only() {
        let (_dir, config, bookmarks) = setup("l1\nl2\nl3\n", 1);
        let mut source = FileLineSource::open(&config, &bookmarks).unwrap();
        let first = source.next_batch().await.unwrap().unwrap();
        source.advance(&first.position).await.unwrap();
        // read but never acknowledged
        let _ = source.next_batch().await.unwrap().unwrap();

        let mut reopened = FileLineSource::open(&config, &bookmarks).unwrap();
        let batch = reopened.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.lines, ["l2"]);
    }

    #[tokio::test]
    async fn truncated_file_restarts_at_zero() {
        let (_dir, config, bookmarks) = setup("line one\nline two\n", 10);
        let mut source = FileLineSource::open(&config, &bookmarks).unwrap();
        source.next_batch().await.unwrap().unwrap();
        fs::write(&config.file, "new\n").unwrap();
        let batch = source.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.lines, ["new"]);
        assert_eq!(batch.position.offset, 4);
    }

    #[tokio::test]
    async fn corrupt_bookmark_is_reported() {
        let (_dir, config, bookmarks) = setup("l1\n", 10);
        fs::create_dir_all(&bookmarks).unwrap();
        fs::write(bookmarks.join("maillog.json"), "{not json").unwrap();
        assert!(matches!(
            FileLineSource::open(&config, &bookmarks),
            Err(ReaderError::Bookmark { .. })
        ));
    }

    #[tokio::test]
    async fn bookmark_for_other_file_is_ignored() {
        let (_dir, config, bookmarks) = setup("l1\n", 10);
        fs::create_dir_all(&bookmarks).unwrap();
        let foreign = Bookmark {
            file: PathBuf::from("/elsewhere/maillog"),
            offset: 99,
            lines: 9,
        };
        store_bookmark(&bookmarks.join("maillog.json"), &foreign).unwrap();
        let source = FileLineSource::open(&config, &bookmarks).unwrap();
        assert_eq!(source.position().offset, 0);
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let (_dir, mut config, bookmarks) = setup("", 10);
        config.file = config.file.with_file_name("absent");
        let mut source = FileLineSource::open(&config, &bookmarks).unwrap();
        assert!(matches!(
            source.next_batch().await,
            Err(ReaderError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn vec_source_batches_and_records_acks() {
        let mut source = VecLineSource::from_text("mem", "a\n\nb\nc\n", 2);
        let first = source.next_batch().await.unwrap().unwrap();
        assert_eq!(first.lines, ["a", "b"]);
        source.advance(&first.position).await.unwrap();
        let second = source.next_batch().await.unwrap().unwrap();
        assert_eq!(second.lines, ["c"]);
        assert!(source.next_batch().await.unwrap().is_none());
        assert_eq!(source.acknowledged().len(), 1);
        assert_eq!(source.acknowledged()[0].lines, 2);
    }
}
