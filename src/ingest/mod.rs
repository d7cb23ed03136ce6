//! Streaming ingestion: tail -> parse -> score -> persist.
//!
//! The loop moves through `Ready -> Streaming -> ShuttingDown -> Stopped`.
//! It polls the log source at a bounded interval so a cancellation is seen
//! promptly, and it always finishes the line in hand before stopping.

pub mod tail;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::mitigation::Mitigation;
use crate::model::{Detector, Verdict};
use crate::parser;
use crate::store::{AnomalyRecord, AnomalyStore};

use self::tail::{TailLine, Tailer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Ready,
    Streaming,
    ShuttingDown,
    Stopped,
}

/// What happened to one input line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Skipped,
    ParseFailed,
    Normal { score: f64 },
    Anomalous { record_id: Uuid, score: f64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub lines: u64,
    pub parse_failures: u64,
    pub normal: u64,
    pub anomalies: u64,
    pub errors: u64,
}

impl IngestStats {
    pub fn merge(&mut self, other: &IngestStats) {
        self.lines += other.lines;
        self.parse_failures += other.parse_failures;
        self.normal += other.normal;
        self.anomalies += other.anomalies;
        self.errors += other.errors;
    }
}

pub struct IngestLoop {
    source: PathBuf,
    detector: Arc<Detector>,
    store: Arc<AnomalyStore>,
    mitigation: Option<Arc<dyn Mitigation>>,
    poll_interval: Duration,
    state: LoopState,
    stats: IngestStats,
}

impl IngestLoop {
    /// A loop can only be built from a trained detector, so it never scores
    /// while uninitialized.
    pub fn new(
        source: impl Into<PathBuf>,
        detector: Arc<Detector>,
        store: Arc<AnomalyStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source: source.into(),
            detector,
            store,
            mitigation: None,
            poll_interval,
            state: LoopState::Ready,
            stats: IngestStats::default(),
        }
    }

    pub fn with_mitigation(mut self, mitigation: Arc<dyn Mitigation>) -> Self {
        self.mitigation = Some(mitigation);
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    fn transition(&mut self, next: LoopState) {
        debug!(source = %self.source.display(), from = ?self.state, to = ?next, "ingest state change");
        self.state = next;
    }

    /// Parse, score and (if anomalous) persist one line.
    ///
    /// Parse failures are reported and counted, never returned as errors.
    pub async fn process_line(&mut self, line: &str) -> Result<LineOutcome> {
        if line.trim().is_empty() {
            return Ok(LineOutcome::Skipped);
        }
        self.stats.lines += 1;

        let record = match parser::parse_line(line) {
            Ok(r) => r,
            Err(e) => {
                self.stats.parse_failures += 1;
                warn!(source = %self.source.display(), error = %e, "failed to parse log entry");
                return Ok(LineOutcome::ParseFailed);
            }
        };

        let scored = self.detector.score(&record)?;
        if scored.verdict == Verdict::Normal {
            self.stats.normal += 1;
            return Ok(LineOutcome::Normal {
                score: scored.score,
            });
        }

        let ip = record.ip_address.clone();
        let anomaly = AnomalyRecord::new(record, scored.score);
        let record_id = anomaly.id;

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.append(&anomaly))
            .await
            .context("anomaly store task panicked")??;
        self.stats.anomalies += 1;
        warn!(ip = %ip, score = scored.score, id = %record_id, "anomaly detected");

        if let Some(mitigation) = &self.mitigation {
            let mitigation = mitigation.clone();
            let ip = ip.clone();
            tokio::spawn(async move {
                if let Err(e) = mitigation.mitigate(&ip).await {
                    warn!(ip = %ip, hook = mitigation.name(), error = %e, "mitigation failed");
                }
            });
        }

        Ok(LineOutcome::Anomalous {
            record_id,
            score: scored.score,
        })
    }

    /// Tail the source until `cancel` fires. Returns the final counters.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<IngestStats> {
        let mut tailer = Tailer::open_at_end(&self.source).await?;
        self.transition(LoopState::Streaming);
        info!(source = %self.source.display(), poll_ms = self.poll_interval.as_millis() as u64, "streaming log source");

        while !cancel.is_cancelled() {
            let line = match tailer.next_line().await {
                Ok(line) => line,
                Err(e) => {
                    self.stats.errors += 1;
                    error!(source = %self.source.display(), error = %e, "log source read failed");
                    None
                }
            };

            match line {
                Some(TailLine::Complete(line)) => {
                    if let Err(e) = self.process_line(&line).await {
                        self.stats.errors += 1;
                        error!(source = %self.source.display(), error = %e, "failed to process log entry");
                    }
                }
                Some(TailLine::Oversized(bytes)) => {
                    self.stats.lines += 1;
                    self.stats.parse_failures += 1;
                    warn!(source = %self.source.display(), bytes, "dropped oversized log entry");
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        self.transition(LoopState::ShuttingDown);
        info!(
            source = %self.source.display(),
            lines = self.stats.lines,
            anomalies = self.stats.anomalies,
            parse_failures = self.stats.parse_failures,
            "ingestion stopped"
        );
        self.transition(LoopState::Stopped);
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureRow;
    use crate::model::ForestParams;
    use crate::parser::parse_line;
    use crate::parser::tests::SAMPLE;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn detector() -> Arc<Detector> {
        let normal = parse_line(SAMPLE).unwrap();
        let mut rows: Vec<FeatureRow> = (0..95)
            .map(|i| {
                let mut r = normal.clone();
                r.bytes_sent = 500 + i % 10;
                FeatureRow::from(&r)
            })
            .collect();
        for _ in 0..5 {
            let mut r = normal.clone();
            r.status_code = 500;
            r.bytes_sent = 50_000;
            rows.push(FeatureRow::from(&r));
        }
        Arc::new(Detector::train(&rows, ForestParams::default()).unwrap())
    }

    fn outlier_line(ip: &str) -> String {
        SAMPLE
            .replacen("192.168.1.10", ip, 1)
            .replace("\" 200 512 ", "\" 500 50000 ")
    }

    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl Mitigation for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        async fn mitigate(&self, source: &str) -> Result<(), crate::mitigation::MitigationError> {
            self.0.lock().unwrap().push(source.to_string());
            Err(crate::mitigation::MitigationError::EmptyCommand)
        }
    }

    #[tokio::test]
    async fn test_process_line_outcomes() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(AnomalyStore::open(dir.path().join("anomalies.jsonl")).unwrap());
        let mut ingest = IngestLoop::new(dir.path().join("access.log"), detector(), store.clone(), Duration::from_millis(10));

        assert_eq!(ingest.process_line("   \n").await.unwrap(), LineOutcome::Skipped);
        assert_eq!(ingest.process_line("garbage").await.unwrap(), LineOutcome::ParseFailed);
        assert!(matches!(
            ingest.process_line(SAMPLE).await.unwrap(),
            LineOutcome::Normal { .. }
        ));
        assert!(matches!(
            ingest.process_line(&outlier_line("203.0.113.5")).await.unwrap(),
            LineOutcome::Anomalous { .. }
        ));

        let stats = ingest.stats();
        assert_eq!(stats.lines, 3);
        assert_eq!(stats.parse_failures, 1);
        assert_eq!(stats.normal, 1);
        assert_eq!(stats.anomalies, 1);

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ip_address, "203.0.113.5");
        assert_eq!(all[0].anomaly_data.status_code, 500);
    }

    #[tokio::test]
    async fn test_failed_mitigation_does_not_affect_detection() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(AnomalyStore::open(dir.path().join("anomalies.jsonl")).unwrap());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut ingest = IngestLoop::new(dir.path().join("access.log"), detector(), store.clone(), Duration::from_millis(10))
            .with_mitigation(recorder.clone());

        let outcome = ingest.process_line(&outlier_line("203.0.113.9")).await.unwrap();
        assert!(matches!(outcome, LineOutcome::Anomalous { .. }));

        // The hook runs detached; give it a moment.
        for _ in 0..50 {
            if !recorder.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*recorder.0.lock().unwrap(), vec!["203.0.113.9".to_string()]);
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_tails_new_lines_and_stops_on_cancel() {
        use std::io::Write;

        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("access.log");
        // Pre-existing content must not be replayed.
        std::fs::write(&log, format!("{}\n", outlier_line("198.51.100.1"))).unwrap();

        let store = Arc::new(AnomalyStore::open(dir.path().join("anomalies.jsonl")).unwrap());
        let ingest = IngestLoop::new(&log, detector(), store.clone(), Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ingest.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
            writeln!(f, "{}", outlier_line("203.0.113.7")).unwrap();
            writeln!(f, "{SAMPLE}").unwrap();
        }

        for _ in 0..100 {
            if !store.load_all().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap()
            .unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ip_address, "203.0.113.7");
        assert_eq!(stats.anomalies, 1);
    }

    #[tokio::test]
    async fn test_oversized_line_counts_as_parse_failure() {
        use std::io::Write;

        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("access.log");
        std::fs::write(&log, "").unwrap();

        let store = Arc::new(AnomalyStore::open(dir.path().join("anomalies.jsonl")).unwrap());
        let ingest = IngestLoop::new(&log, detector(), store.clone(), Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ingest.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
            writeln!(f, "{}", "A".repeat(tail::MAX_LINE_BYTES * 2)).unwrap();
            writeln!(f, "{}", outlier_line("203.0.113.8")).unwrap();
        }

        for _ in 0..100 {
            if !store.load_all().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap()
            .unwrap();

        assert_eq!(stats.lines, 2);
        assert_eq!(stats.parse_failures, 1);
        assert_eq!(stats.anomalies, 1);
        assert_eq!(store.load_all().unwrap()[0].ip_address, "203.0.113.8");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_during_slow_append_finishes_the_line() {
        use crate::store::lock::FileLock;
        use std::io::Write;

        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("access.log");
        std::fs::write(&log, "").unwrap();

        let store = Arc::new(AnomalyStore::open(dir.path().join("anomalies.jsonl")).unwrap());
        let ingest = IngestLoop::new(&log, detector(), store.clone(), Duration::from_millis(20));
        let cancel = CancellationToken::new();

        // Another writer holds the store lock, so the append blocks.
        let held = FileLock::acquire(store.lock_path()).unwrap();
        let handle = tokio::spawn(ingest.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
            writeln!(f, "{}", outlier_line("203.0.113.10")).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished(), "loop stopped with a line in hand");
        assert!(store.load_all().unwrap().is_empty());

        drop(held);
        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop once the append completes")
            .unwrap()
            .unwrap();

        assert_eq!(stats.anomalies, 1);
        let report = store.load().unwrap();
        assert!(!report.incomplete_tail);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].ip_address, "203.0.113.10");
    }

    #[test]
    fn test_stats_merge() {
        let mut a = IngestStats {
            lines: 1,
            anomalies: 1,
            ..Default::default()
        };
        a.merge(&IngestStats {
            lines: 2,
            parse_failures: 1,
            ..Default::default()
        });
        assert_eq!(a.lines, 3);
        assert_eq!(a.parse_failures, 1);
        assert_eq!(a.anomalies, 1);
    }
}
