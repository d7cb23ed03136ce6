//! Reviewer-facing view of the anomaly store.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::store::{AnomalyRecord, AnomalyStore, ReviewSummary};

pub use crate::store::ReviewDecision;

/// Unreviewed records for one source, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSource {
    pub ip_address: String,
    pub records: Vec<AnomalyRecord>,
}

impl PendingSource {
    pub fn max_score(&self) -> f64 {
        self.records.iter().map(|r| r.score).fold(f64::NAN, f64::max)
    }
}

pub struct ReviewWorkflow {
    store: Arc<AnomalyStore>,
}

impl ReviewWorkflow {
    pub fn new(store: Arc<AnomalyStore>) -> Self {
        Self { store }
    }

    /// Unreviewed records grouped by source, in order of first detection.
    pub fn pending(&self) -> Result<Vec<PendingSource>> {
        let snapshot = self.store.snapshot()?;
        let mut groups: Vec<PendingSource> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for record in snapshot.unreviewed() {
            let slot = *index.entry(record.ip_address.clone()).or_insert_with(|| {
                groups.push(PendingSource {
                    ip_address: record.ip_address.clone(),
                    records: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].records.push(record.clone());
        }
        Ok(groups)
    }

    /// Apply a batch of verdicts. Repeating a batch is a no-op.
    pub fn submit(&self, verdicts: &HashMap<String, ReviewDecision>) -> Result<ReviewSummary> {
        let summary = self.store.review_all(verdicts)?;
        info!(
            verdicts = verdicts.len(),
            updated = summary.updated,
            unmatched = summary.unmatched_sources.len(),
            "review batch submitted"
        );
        Ok(summary)
    }

    /// Prompt for each pending source on `output`, read answers from `input`
    /// and submit them as one batch. `y` marks a true positive, `n` a false
    /// positive, `d` dismisses; anything else leaves the source pending.
    pub fn interactive<R: BufRead, W: Write>(&self, mut input: R, mut output: W) -> Result<ReviewSummary> {
        let pending = self.pending()?;
        if pending.is_empty() {
            writeln!(output, "No anomalies pending review.")?;
            return Ok(ReviewSummary::default());
        }

        let mut verdicts = HashMap::new();
        for source in &pending {
            let first = &source.records[0];
            writeln!(
                output,
                "{} ({} detections, max score {:.3}): {} {} -> {} ({} bytes)",
                source.ip_address,
                source.records.len(),
                source.max_score(),
                first.anomaly_data.method,
                first.anomaly_data.resource,
                first.anomaly_data.status_code,
                first.anomaly_data.bytes_sent,
            )?;
            write!(output, "Is this a true anomaly? [y]es / [n]o / [d]ismiss, anything else skips: ")?;
            output.flush()?;

            let mut answer = String::new();
            if input.read_line(&mut answer).context("failed to read answer")? == 0 {
                break;
            }
            match answer.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => {
                    verdicts.insert(source.ip_address.clone(), ReviewDecision::TruePositive);
                }
                "n" | "no" => {
                    verdicts.insert(source.ip_address.clone(), ReviewDecision::FalsePositive);
                }
                "d" | "dismiss" => {
                    verdicts.insert(source.ip_address.clone(), ReviewDecision::Dismissed);
                }
                _ => {}
            }
        }

        if verdicts.is_empty() {
            writeln!(output, "No verdicts given.")?;
            return Ok(ReviewSummary::default());
        }
        let summary = self.submit(&verdicts)?;
        writeln!(output, "Updated {} record(s).", summary.updated)?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_line;
    use crate::parser::tests::SAMPLE;
    use crate::store::Feedback;

    fn seeded(ips: &[&str]) -> (tempfile::TempDir, ReviewWorkflow, Arc<AnomalyStore>) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(AnomalyStore::open(dir.path().join("anomalies.jsonl")).unwrap());
        let base = parse_line(SAMPLE).unwrap();
        for (i, ip) in ips.iter().enumerate() {
            let mut r = base.clone();
            r.ip_address = ip.to_string();
            store.append(&AnomalyRecord::new(r, 0.6 + i as f64 * 0.01)).unwrap();
        }
        (dir, ReviewWorkflow::new(store.clone()), store)
    }

    #[test]
    fn test_pending_groups_by_first_seen() {
        let (_dir, review, _) = seeded(&["10.0.0.2", "10.0.0.1", "10.0.0.2"]);
        let pending = review.pending().unwrap();
        let ips: Vec<&str> = pending.iter().map(|p| p.ip_address.as_str()).collect();
        assert_eq!(ips, ["10.0.0.2", "10.0.0.1"]);
        assert_eq!(pending[0].records.len(), 2);
        assert!((pending[0].max_score() - 0.62).abs() < 1e-12);
    }

    #[test]
    fn test_submit_true_positive_is_idempotent() {
        let (_dir, review, store) = seeded(&["203.0.113.5"]);
        let verdicts = HashMap::from([("203.0.113.5".to_string(), ReviewDecision::TruePositive)]);

        let first = review.submit(&verdicts).unwrap();
        assert_eq!(first.updated, 1);
        let after_first = store.load_all().unwrap();
        assert!(after_first[0].reviewed);
        assert_eq!(after_first[0].feedback, Some(Feedback::TruePositive));

        let second = review.submit(&verdicts).unwrap();
        assert_eq!(second.updated, 0);
        assert_eq!(store.load_all().unwrap(), after_first);
        assert!(review.pending().unwrap().is_empty());
    }

    #[test]
    fn test_interactive_applies_answers_in_one_batch() {
        let (_dir, review, store) = seeded(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);
        let input = b"y\nn\nd\nmaybe\n".as_slice();
        let mut output = Vec::new();

        let summary = review.interactive(input, &mut output).unwrap();
        assert_eq!(summary.updated, 3);
        assert_eq!(summary.still_pending, 1);

        let by_ip: HashMap<String, AnomalyRecord> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|r| (r.ip_address.clone(), r))
            .collect();
        assert_eq!(by_ip["10.0.0.1"].feedback, Some(Feedback::TruePositive));
        assert_eq!(by_ip["10.0.0.2"].feedback, Some(Feedback::FalsePositive));
        assert!(by_ip["10.0.0.3"].reviewed);
        assert_eq!(by_ip["10.0.0.3"].feedback, None);
        assert!(!by_ip["10.0.0.4"].reviewed);

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("10.0.0.1 (1 detections"));
        assert!(text.contains("Updated 3 record(s)."));
        assert_eq!(text.matches("anything else skips").count(), 4);
    }

    #[test]
    fn test_interactive_unknown_answer_leaves_source_pending() {
        let (_dir, review, store) = seeded(&["10.0.0.1"]);
        let mut output = Vec::new();

        let summary = review.interactive(b"skip\n".as_slice(), &mut output).unwrap();
        assert_eq!(summary, ReviewSummary::default());
        assert!(String::from_utf8(output).unwrap().contains("No verdicts given."));
        assert_eq!(store.snapshot().unwrap().unreviewed().count(), 1);
    }

    #[test]
    fn test_interactive_with_nothing_pending() {
        let (_dir, review, _) = seeded(&[]);
        let mut output = Vec::new();
        let summary = review.interactive(b"".as_slice(), &mut output).unwrap();
        assert_eq!(summary, ReviewSummary::default());
        assert!(String::from_utf8(output).unwrap().contains("No anomalies pending"));
    }

    #[test]
    fn test_interactive_stops_at_end_of_input() {
        let (_dir, review, store) = seeded(&["10.0.0.1", "10.0.0.2"]);
        let summary = review.interactive(b"y\n".as_slice(), Vec::new()).unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(store.snapshot().unwrap().unreviewed().count(), 1);
    }
}
