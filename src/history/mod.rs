//! Historical training data.
//!
//! Two sources are accepted: a CSV export of past requests (one row per
//! request, headers naming the columns) and a raw access log in the live
//! grammar. Both produce [`FeatureRow`]s for [`crate::model::Detector::train`].

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use tracing::{info, warn};

use crate::features::{FeatureRow, N_CATEGORICAL, N_NUMERIC};
use crate::parser::{self, TIMESTAMP_FORMAT};

/// Where a CSV column lands in a [`FeatureRow`].
#[derive(Debug, Clone, Copy, PartialEq)]
enum Target {
    Categorical(usize),
    Numeric(usize),
    Timestamp,
}

/// Map a header such as `Response Time (seconds)` onto the schema.
fn resolve(header: &str) -> Option<Target> {
    let mut key = String::with_capacity(header.len());
    for c in header.trim().chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }
    let key = key.trim_matches('_');
    let key = key.strip_suffix("_seconds").unwrap_or(key);

    let target = match key {
        "method" => Target::Categorical(0),
        "resource" | "path" | "request_path" => Target::Categorical(1),
        "user_agent" => Target::Categorical(2),
        "status_code" | "status" => Target::Numeric(0),
        "bytes_sent" | "bytes" => Target::Numeric(1),
        "source_port" => Target::Numeric(2),
        "destination_port" => Target::Numeric(3),
        "response_time" => Target::Numeric(4),
        "backend_time" => Target::Numeric(5),
        "hour" => Target::Numeric(6),
        "day" => Target::Numeric(7),
        "weekday" => Target::Numeric(8),
        "timestamp" => Target::Timestamp,
        _ => return None,
    };
    Some(target)
}

/// Unparseable cells become gaps for the transformer to impute.
fn cell_number(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f64>().ok().filter(|x| x.is_finite())
}

fn cell_text(raw: &str) -> Option<String> {
    let raw = raw.trim();
    (!raw.is_empty()).then(|| raw.to_string())
}

fn cell_timestamp(raw: &str) -> Option<DateTime<chrono::FixedOffset>> {
    let raw = raw.trim();
    DateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
}

/// Load a CSV of past requests.
pub fn load_csv(path: &Path) -> Result<Vec<FeatureRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open historical data: {}", path.display()))?;

    let columns: Vec<Option<Target>> = reader
        .headers()
        .with_context(|| format!("failed to read CSV header: {}", path.display()))?
        .iter()
        .map(resolve)
        .collect();

    let mapped = columns.iter().flatten().count();
    let has_timestamp = columns.contains(&Some(Target::Timestamp));
    let has_numeric = has_timestamp || columns.iter().any(|c| matches!(c, Some(Target::Numeric(_))));
    if !has_numeric {
        let headers: Vec<&str> = reader.headers()?.iter().collect();
        bail!(
            "historical data {} has no numeric or timestamp column the model can use \
             ({mapped} of {} headers recognised: {})",
            path.display(),
            headers.len(),
            headers.join(", ")
        );
    }

    let mut rows = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(line = line + 2, error = %e, "skipping unreadable CSV row");
                continue;
            }
        };

        let mut row = FeatureRow::default();
        let mut timestamp = None;
        for (cell, target) in record.iter().zip(&columns) {
            match target {
                Some(Target::Categorical(j)) if *j < N_CATEGORICAL => row.categorical[*j] = cell_text(cell),
                Some(Target::Numeric(j)) if *j < N_NUMERIC => row.numeric[*j] = cell_number(cell),
                Some(Target::Timestamp) => timestamp = cell_timestamp(cell),
                _ => {}
            }
        }
        // Derived time columns win over any explicit ones.
        if has_timestamp {
            row.set_time(timestamp);
        }
        rows.push(row);
    }

    info!(path = %path.display(), rows = rows.len(), columns = mapped, "loaded historical CSV");
    Ok(rows)
}

/// Load rows from an access log in the live grammar. Unparseable lines are
/// counted and dropped.
pub fn load_access_log(path: &Path) -> Result<Vec<FeatureRow>> {
    let content = std::fs::read(path)
        .with_context(|| format!("failed to read access log: {}", path.display()))?;
    let text = String::from_utf8_lossy(&content);
    let (records, failures) = parser::parse_lines(text.lines());
    if failures > 0 {
        warn!(path = %path.display(), failures, "dropped unparseable lines from training log");
    }
    info!(path = %path.display(), rows = records.len(), "loaded access log for training");
    Ok(records.iter().map(FeatureRow::from).collect())
}
