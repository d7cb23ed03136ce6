//! Durable anomaly record store.
//!
//! Records are kept as JSON lines in a single file. The detector appends one
//! line per detection; the reviewer rewrites the whole file with updated
//! verdicts. Every writer takes the same two locks, in order:
//!
//! 1. an in-process mutex, and
//! 2. an advisory `flock` on `<store>.lock`, shared with other processes.
//!
//! Rewrites go to a temp file in the same directory and are renamed over the
//! store, so lock-free readers only ever see a complete file (plus, at most,
//! a trailing line that an appender is still writing).

pub(crate) mod lock;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::parser::LogRecord;

use self::lock::FileLock;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Reviewer verdict stored on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    TruePositive,
    FalsePositive,
}

/// What a reviewer decided for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    TruePositive,
    FalsePositive,
    /// Close the record without a verdict.
    Dismissed,
}

impl ReviewDecision {
    pub fn feedback(self) -> Option<Feedback> {
        match self {
            ReviewDecision::TruePositive => Some(Feedback::TruePositive),
            ReviewDecision::FalsePositive => Some(Feedback::FalsePositive),
            ReviewDecision::Dismissed => None,
        }
    }
}

impl std::str::FromStr for ReviewDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true_positive" | "tp" | "yes" | "y" => Ok(ReviewDecision::TruePositive),
            "false_positive" | "fp" | "no" | "n" => Ok(ReviewDecision::FalsePositive),
            "dismissed" | "dismiss" | "d" => Ok(ReviewDecision::Dismissed),
            other => Err(format!("unknown review decision '{other}'")),
        }
    }
}

/// One flagged detection event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: Uuid,
    /// Source identity of the flagged request.
    pub ip_address: String,
    /// When the detector flagged it.
    pub timestamp: DateTime<Utc>,
    /// The full parsed request, for human inspection.
    pub anomaly_data: LogRecord,
    pub score: f64,
    #[serde(default)]
    pub reviewed: bool,
    #[serde(default)]
    pub feedback: Option<Feedback>,
}

impl AnomalyRecord {
    pub fn new(record: LogRecord, score: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            ip_address: record.ip_address.clone(),
            timestamp: Utc::now(),
            anomaly_data: record,
            score,
            reviewed: false,
            feedback: None,
        }
    }

    /// Apply a reviewer decision. Already-reviewed records are left alone.
    fn apply(&mut self, decision: ReviewDecision) -> bool {
        if self.reviewed {
            return false;
        }
        self.feedback = decision.feedback();
        self.reviewed = true;
        true
    }
}

// ---------------------------------------------------------------------------
// Read results
// ---------------------------------------------------------------------------

/// Everything read from the store, plus what had to be skipped.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<AnomalyRecord>,
    /// The file ended in a line with no terminating newline.
    pub incomplete_tail: bool,
    /// Complete lines that did not decode.
    pub skipped: usize,
}

/// Records with an index by source identity.
#[derive(Debug, Default)]
pub struct AnomalySnapshot {
    records: Vec<AnomalyRecord>,
    by_source: HashMap<String, Vec<usize>>,
}

impl AnomalySnapshot {
    fn new(records: Vec<AnomalyRecord>) -> Self {
        let mut by_source: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, r) in records.iter().enumerate() {
            by_source.entry(r.ip_address.clone()).or_default().push(i);
        }
        Self { records, by_source }
    }

    pub fn records(&self) -> &[AnomalyRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<AnomalyRecord> {
        self.records
    }

    pub fn is_known(&self, source: &str) -> bool {
        self.by_source.contains_key(source)
    }

    pub fn for_source<'a>(&'a self, source: &str) -> impl Iterator<Item = &'a AnomalyRecord> + 'a {
        self.by_source
            .get(source)
            .map(|v| v.as_slice())
            .unwrap_or_default()
            .iter()
            .map(move |&i| &self.records[i])
    }

    pub fn unreviewed(&self) -> impl Iterator<Item = &AnomalyRecord> {
        self.records.iter().filter(|r| !r.reviewed)
    }

    pub fn sources(&self) -> usize {
        self.by_source.len()
    }
}

/// Outcome of [`AnomalyStore::review_all`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewSummary {
    /// Records that moved from unreviewed to reviewed.
    pub updated: usize,
    /// Unreviewed records with no verdict in this batch.
    pub still_pending: usize,
    /// Verdict keys that matched no unreviewed record.
    pub unmatched_sources: Vec<String>,
}

// ---------------------------------------------------------------------------
// AnomalyStore
// ---------------------------------------------------------------------------

pub struct AnomalyStore {
    path: PathBuf,
    lock_path: PathBuf,
    writer: Mutex<()>,
}

impl AnomalyStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory: {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open anomaly store: {}", path.display()))?;

        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");

        debug!(path = %path.display(), "anomaly store opened");
        Ok(Self {
            path,
            lock_path: PathBuf::from(lock_name),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Durably append one record.
    ///
    /// The file is reopened on every call so an append can never land in a
    /// file that a concurrent rewrite has already replaced.
    pub fn append(&self, record: &AnomalyRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("failed to serialize anomaly record")?;
        line.push(b'\n');

        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let _flock = FileLock::acquire(&self.lock_path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open anomaly store: {}", self.path.display()))?;
        // Terminate a line left behind by a writer that died mid-record so the
        // new record starts on its own line.
        if ends_mid_line(&mut file)
            .with_context(|| format!("failed to inspect anomaly store: {}", self.path.display()))?
        {
            warn!(path = %self.path.display(), "closing incomplete trailing record before append");
            line.insert(0, b'\n');
        }
        file.write_all(&line)
            .with_context(|| format!("failed to append to anomaly store: {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("failed to sync anomaly store: {}", self.path.display()))?;

        debug!(ip = %record.ip_address, id = %record.id, "anomaly record appended");
        Ok(())
    }

    /// Read every complete record in file order. Lock-free.
    pub fn load(&self) -> Result<LoadReport> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read anomaly store: {}", self.path.display()))
            }
        };

        let mut report = LoadReport::default();
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            let Some(end) = rest.iter().position(|&b| b == b'\n') else {
                // An appender is mid-write, or a writer died mid-line.
                report.incomplete_tail = true;
                warn!(path = %self.path.display(), bytes = rest.len(), "ignoring incomplete trailing record");
                break;
            };
            let line = &rest[..end];
            rest = &rest[end + 1..];

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<AnomalyRecord>(line) {
                Ok(r) => report.records.push(r),
                Err(e) => {
                    report.skipped += 1;
                    warn!(path = %self.path.display(), error = %e, "skipping undecodable record");
                }
            }
        }
        Ok(report)
    }

    pub fn load_all(&self) -> Result<Vec<AnomalyRecord>> {
        Ok(self.load()?.records)
    }

    pub fn snapshot(&self) -> Result<AnomalySnapshot> {
        Ok(AnomalySnapshot::new(self.load_all()?))
    }

    /// Apply `verdicts` (keyed by source identity) to every unreviewed record
    /// of that source, then atomically replace the store. Reviewed records
    /// and sources without a verdict are untouched. When nothing changes the
    /// file is not rewritten.
    pub fn review_all(&self, verdicts: &HashMap<String, ReviewDecision>) -> Result<ReviewSummary> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let _flock = FileLock::acquire(&self.lock_path)?;

        let mut records = self.load()?.records;
        let mut summary = ReviewSummary::default();
        let mut matched: HashMap<&str, bool> = verdicts.keys().map(|k| (k.as_str(), false)).collect();

        for record in records.iter_mut().filter(|r| !r.reviewed) {
            match verdicts.get(&record.ip_address) {
                Some(decision) => {
                    if let Some(hit) = matched.get_mut(record.ip_address.as_str()) {
                        *hit = true;
                    }
                    if record.apply(*decision) {
                        summary.updated += 1;
                    }
                }
                None => summary.still_pending += 1,
            }
        }
        summary.unmatched_sources = matched
            .into_iter()
            .filter(|(_, hit)| !hit)
            .map(|(k, _)| k.to_string())
            .collect();
        summary.unmatched_sources.sort();

        if summary.updated == 0 {
            debug!("review batch changed nothing; store left as is");
            return Ok(summary);
        }

        let mut body = Vec::new();
        for r in &records {
            serde_json::to_writer(&mut body, r).context("failed to serialize anomaly record")?;
            body.push(b'\n');
        }
        write_atomic(&self.path, &body)
            .with_context(|| format!("failed to rewrite anomaly store: {}", self.path.display()))?;

        info!(
            updated = summary.updated,
            still_pending = summary.still_pending,
            "anomaly store reviewed"
        );
        Ok(summary)
    }
}

fn ends_mid_line(file: &mut std::fs::File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Replace `path` with `contents` via a synced temp file and a rename in the
/// same directory.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory: {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
