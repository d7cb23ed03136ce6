//! Feature extraction and normalization.
//!
//! The column set is a static schema: three categorical columns encoded to
//! integer codes and nine numeric columns (three of them derived from the
//! request timestamp). A [`FeatureTransformer`] is fit once on a batch of
//! rows and afterwards applies exactly the same imputation, encoding and
//! scaling to every row it sees, training or live.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parser::LogRecord;

pub const CATEGORICAL_COLUMNS: [&str; 3] = ["method", "resource", "user_agent"];

pub const NUMERIC_COLUMNS: [&str; 9] = [
    "status_code",
    "bytes_sent",
    "source_port",
    "destination_port",
    "response_time",
    "backend_time",
    "hour",
    "day",
    "weekday",
];

pub const N_CATEGORICAL: usize = CATEGORICAL_COLUMNS.len();
pub const N_NUMERIC: usize = NUMERIC_COLUMNS.len();
pub const N_FEATURES: usize = N_CATEGORICAL + N_NUMERIC;

/// Category substituted for missing categorical values before encoding.
pub const MISSING_CATEGORY: &str = "__missing__";

/// Code assigned to any category not observed at fit time.
pub const UNSEEN_CODE: u32 = 0;

const HOUR: usize = 6;
const DAY: usize = 7;
const WEEKDAY: usize = 8;

/// Ordered feature names: categorical codes first, then numerics.
pub fn feature_names() -> Vec<String> {
    CATEGORICAL_COLUMNS
        .iter()
        .chain(NUMERIC_COLUMNS.iter())
        .map(|s| s.to_string())
        .collect()
}

/// Fixed-order numeric vector laid out per [`feature_names`].
pub type FeatureVector = Vec<f64>;

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("feature transformer has not been fit")]
    Uninitialized,

    #[error("cannot fit feature transformer on an empty batch")]
    EmptyBatch,
}

// ---------------------------------------------------------------------------
// FeatureRow
// ---------------------------------------------------------------------------

/// Tabular view of one request restricted to the schema columns.
///
/// Parsed log lines always fill every column; rows loaded from historical
/// tables may leave gaps, which the transformer imputes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub categorical: [Option<String>; N_CATEGORICAL],
    pub numeric: [Option<f64>; N_NUMERIC],
}

impl FeatureRow {
    /// Fill the hour / day-of-month / weekday columns from `ts`.
    /// Weekday counts from Monday = 0.
    pub fn set_time(&mut self, ts: Option<DateTime<FixedOffset>>) {
        self.numeric[HOUR] = ts.map(|t| f64::from(t.hour()));
        self.numeric[DAY] = ts.map(|t| f64::from(t.day()));
        self.numeric[WEEKDAY] = ts.map(|t| f64::from(t.weekday().num_days_from_monday()));
    }
}

impl From<&LogRecord> for FeatureRow {
    fn from(rec: &LogRecord) -> Self {
        let mut row = FeatureRow {
            categorical: [
                Some(rec.method.clone()),
                Some(rec.resource.clone()),
                Some(rec.user_agent.clone()),
            ],
            numeric: [
                Some(f64::from(rec.status_code)),
                Some(rec.bytes_sent as f64),
                Some(f64::from(rec.source_port)),
                Some(f64::from(rec.destination_port)),
                Some(rec.response_time),
                Some(rec.backend_time),
                None,
                None,
                None,
            ],
        };
        row.set_time(Some(rec.timestamp));
        row
    }
}

// ---------------------------------------------------------------------------
// TransformerState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    codes: BTreeMap<String, u32>,
}

impl CategoryEncoder {
    /// Codes are assigned in sorted order starting at 1.
    fn fit<'a>(values: impl Iterator<Item = &'a str>) -> Self {
        let distinct: BTreeSet<&str> = values.collect();
        let codes = distinct
            .into_iter()
            .zip(1u32..)
            .map(|(v, code)| (v.to_string(), code))
            .collect();
        Self { codes }
    }

    pub fn encode(&self, value: &str) -> u32 {
        self.codes.get(value).copied().unwrap_or(UNSEEN_CODE)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Fitted per-feature location and spread for z-scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl Scaler {
    fn fit(matrix: &[Vec<f64>]) -> Self {
        let n = matrix.len() as f64;
        let width = matrix.first().map_or(0, Vec::len);
        let mut means = vec![0.0; width];
        let mut stds = vec![0.0; width];
        for j in 0..width {
            let mean = matrix.iter().map(|r| r[j]).sum::<f64>() / n;
            let var = matrix.iter().map(|r| (r[j] - mean).powi(2)).sum::<f64>() / n;
            means[j] = mean;
            // Constant columns scale to zero instead of dividing by zero.
            stds[j] = if var.sqrt() > 1e-12 { var.sqrt() } else { 1.0 };
        }
        Self { means, stds }
    }

    fn apply(&self, v: &mut [f64]) {
        for ((x, mean), std) in v.iter_mut().zip(&self.means).zip(&self.stds) {
            *x = (*x - mean) / std;
        }
    }
}

/// Everything learned by [`FeatureTransformer::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerState {
    pub schema: Vec<String>,
    pub encoders: Vec<CategoryEncoder>,
    pub medians: Vec<f64>,
    pub scaler: Scaler,
}

impl TransformerState {
    /// Whether this state was fit against the schema compiled into this binary.
    pub fn schema_matches(&self) -> bool {
        self.schema == feature_names()
            && self.encoders.len() == N_CATEGORICAL
            && self.medians.len() == N_NUMERIC
            && self.scaler.means.len() == N_FEATURES
            && self.scaler.stds.len() == N_FEATURES
    }

    fn encode(&self, row: &FeatureRow) -> FeatureVector {
        let mut v = Vec::with_capacity(N_FEATURES);
        for (value, encoder) in row.categorical.iter().zip(&self.encoders) {
            let category = value.as_deref().unwrap_or(MISSING_CATEGORY);
            v.push(f64::from(encoder.encode(category)));
        }
        for (value, median) in row.numeric.iter().zip(&self.medians) {
            v.push(match value {
                Some(x) if x.is_finite() => *x,
                _ => *median,
            });
        }
        v
    }
}

// ---------------------------------------------------------------------------
// FeatureTransformer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FeatureTransformer {
    state: Option<TransformerState>,
}

impl FeatureTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: TransformerState) -> Self {
        Self { state: Some(state) }
    }

    pub fn state(&self) -> Option<&TransformerState> {
        self.state.as_ref()
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    /// Rebuild the state from scratch using `rows`, replacing any previous fit.
    pub fn fit(&mut self, rows: &[FeatureRow]) -> Result<(), FeatureError> {
        if rows.is_empty() {
            return Err(FeatureError::EmptyBatch);
        }

        let encoders = (0..N_CATEGORICAL)
            .map(|j| {
                CategoryEncoder::fit(
                    rows.iter()
                        .map(|r| r.categorical[j].as_deref().unwrap_or(MISSING_CATEGORY)),
                )
            })
            .collect();

        let medians = (0..N_NUMERIC)
            .map(|j| {
                median(
                    rows.iter()
                        .filter_map(|r| r.numeric[j])
                        .filter(|x| x.is_finite())
                        .collect(),
                )
            })
            .collect();

        let mut state = TransformerState {
            schema: feature_names(),
            encoders,
            medians,
            scaler: Scaler {
                means: Vec::new(),
                stds: Vec::new(),
            },
        };

        let encoded: Vec<FeatureVector> = rows.iter().map(|r| state.encode(r)).collect();
        state.scaler = Scaler::fit(&encoded);

        tracing::debug!(
            rows = rows.len(),
            categories = ?state.encoders.iter().map(CategoryEncoder::len).collect::<Vec<_>>(),
            "feature transformer fit"
        );
        self.state = Some(state);
        Ok(())
    }

    /// Apply the fitted state to one row.
    pub fn transform(&self, row: &FeatureRow) -> Result<FeatureVector, FeatureError> {
        let state = self.state.as_ref().ok_or(FeatureError::Uninitialized)?;
        let mut v = state.encode(row);
        state.scaler.apply(&mut v);
        Ok(v)
    }

    pub fn transform_record(&self, record: &LogRecord) -> Result<FeatureVector, FeatureError> {
        self.transform(&FeatureRow::from(record))
    }

    pub fn transform_batch(&self, rows: &[FeatureRow]) -> Result<Vec<FeatureVector>, FeatureError> {
        rows.iter().map(|r| self.transform(r)).collect()
    }

    pub fn fit_transform(&mut self, rows: &[FeatureRow]) -> Result<Vec<FeatureVector>, FeatureError> {
        self.fit(rows)?;
        self.transform_batch(rows)
    }
}

/// Median of `values`; zero when nothing was observed.
fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
