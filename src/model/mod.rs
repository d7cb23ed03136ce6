//! Outlier model: the fitted transformer and isolation forest, kept and
//! persisted as one matched pair.

pub mod forest;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::features::{FeatureError, FeatureRow, FeatureTransformer, TransformerState, N_FEATURES};
use crate::history;
use crate::parser::LogRecord;
use crate::store::write_atomic;

pub use forest::{ForestParams, IsolationForest, Verdict};

/// On-disk layout version for both halves of the pair.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no trained model is loaded; run `accesswatch train` with historical data first")]
    Uninitialized,

    #[error("training data is empty")]
    EmptyTrainingSet,

    #[error("all {rows} training rows are identical after encoding; nothing to learn from")]
    ConstantTrainingSet { rows: usize },

    #[error("feature width mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: usize, found: usize },

    #[error("model and transformer are not a matched pair ({model} != {transformer})")]
    PairMismatch { model: Uuid, transformer: Uuid },

    #[error("found {present} but not its matching {missing}")]
    MissingPairHalf { present: String, missing: String },

    #[error("unsupported persisted format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error(transparent)]
    Feature(#[from] FeatureError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scored {
    pub verdict: Verdict,
    pub score: f64,
}

#[derive(Serialize, Deserialize)]
struct TransformerFile {
    format_version: u32,
    pair_id: Uuid,
    trained_at: DateTime<Utc>,
    state: TransformerState,
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    format_version: u32,
    pair_id: Uuid,
    trained_at: DateTime<Utc>,
    forest: IsolationForest,
}

/// A transformer and forest trained together. Read-only once built.
#[derive(Debug, Clone)]
pub struct Detector {
    pair_id: Uuid,
    trained_at: DateTime<Utc>,
    transformer: FeatureTransformer,
    forest: IsolationForest,
}

impl Detector {
    /// Fit a fresh transformer and forest on `rows`.
    pub fn train(rows: &[FeatureRow], params: ForestParams) -> Result<Self, ModelError> {
        if rows.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        let mut transformer = FeatureTransformer::new();
        let matrix = transformer.fit_transform(rows)?;
        let forest = IsolationForest::fit(&matrix, params)?;

        let detector = Self {
            pair_id: Uuid::new_v4(),
            trained_at: Utc::now(),
            transformer,
            forest,
        };
        info!(
            pair_id = %detector.pair_id,
            rows = rows.len(),
            contamination = detector.forest.params().contamination,
            "trained outlier model"
        );
        Ok(detector)
    }

    pub fn pair_id(&self) -> Uuid {
        self.pair_id
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    pub fn forest(&self) -> &IsolationForest {
        &self.forest
    }

    pub fn transformer(&self) -> &FeatureTransformer {
        &self.transformer
    }

    pub fn score_row(&self, row: &FeatureRow) -> Result<Scored, ModelError> {
        let v = self.transformer.transform(row)?;
        let score = self.forest.score(&v)?;
        Ok(Scored {
            verdict: self.forest.classify(score),
            score,
        })
    }

    /// Score one parsed request. Pure: no state changes.
    pub fn score(&self, record: &LogRecord) -> Result<Scored, ModelError> {
        self.score_row(&FeatureRow::from(record))
    }

    /// Write both halves. Each file is replaced atomically.
    pub fn save(&self, transformer_path: &Path, model_path: &Path) -> Result<()> {
        let state = self
            .transformer
            .state()
            .ok_or(ModelError::Feature(FeatureError::Uninitialized))?;

        let transformer_file = TransformerFile {
            format_version: FORMAT_VERSION,
            pair_id: self.pair_id,
            trained_at: self.trained_at,
            state: state.clone(),
        };
        let model_file = ModelFile {
            format_version: FORMAT_VERSION,
            pair_id: self.pair_id,
            trained_at: self.trained_at,
            forest: self.forest.clone(),
        };

        write_atomic(transformer_path, &serde_json::to_vec(&transformer_file)?)
            .with_context(|| format!("failed to write transformer state: {}", transformer_path.display()))?;
        write_atomic(model_path, &serde_json::to_vec(&model_file)?)
            .with_context(|| format!("failed to write model: {}", model_path.display()))?;

        info!(
            pair_id = %self.pair_id,
            transformer = %transformer_path.display(),
            model = %model_path.display(),
            "saved model pair"
        );
        Ok(())
    }

    /// Load a persisted pair. `Ok(None)` when neither half exists; any
    /// partial or mismatched pair is an error.
    pub fn load(transformer_path: &Path, model_path: &Path) -> Result<Option<Self>> {
        match (transformer_path.exists(), model_path.exists()) {
            (false, false) => return Ok(None),
            (true, false) => {
                return Err(ModelError::MissingPairHalf {
                    present: transformer_path.display().to_string(),
                    missing: model_path.display().to_string(),
                }
                .into())
            }
            (false, true) => {
                return Err(ModelError::MissingPairHalf {
                    present: model_path.display().to_string(),
                    missing: transformer_path.display().to_string(),
                }
                .into())
            }
            (true, true) => {}
        }

        let transformer_file: TransformerFile = read_json(transformer_path)?;
        let model_file: ModelFile = read_json(model_path)?;

        for version in [transformer_file.format_version, model_file.format_version] {
            if version != FORMAT_VERSION {
                return Err(ModelError::UnsupportedVersion {
                    found: version,
                    expected: FORMAT_VERSION,
                }
                .into());
            }
        }
        if transformer_file.pair_id != model_file.pair_id {
            return Err(ModelError::PairMismatch {
                model: model_file.pair_id,
                transformer: transformer_file.pair_id,
            }
            .into());
        }
        if !transformer_file.state.schema_matches() {
            return Err(ModelError::SchemaMismatch {
                expected: N_FEATURES,
                found: transformer_file.state.schema.len(),
            }
            .into());
        }
        if model_file.forest.n_features() != N_FEATURES {
            return Err(ModelError::SchemaMismatch {
                expected: N_FEATURES,
                found: model_file.forest.n_features(),
            }
            .into());
        }

        info!(
            pair_id = %model_file.pair_id,
            trained_at = %model_file.trained_at,
            "loaded model pair"
        );
        Ok(Some(Self {
            pair_id: model_file.pair_id,
            trained_at: model_file.trained_at,
            transformer: FeatureTransformer::from_state(transformer_file.state),
            forest: model_file.forest,
        }))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to decode {}", path.display()))
}

// ---------------------------------------------------------------------------
// Startup policy
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ModelState {
    Ready(Detector),
    Uninitialized,
}

/// Load the persisted pair if present, else train from historical data if
/// present (and persist the result), else stay uninitialized.
pub fn bootstrap(config: &Config) -> Result<ModelState> {
    let paths = &config.paths;
    if let Some(detector) = Detector::load(&paths.transformer, &paths.model)? {
        return Ok(ModelState::Ready(detector));
    }

    if paths.historical_data.exists() {
        info!(path = %paths.historical_data.display(), "no persisted model, training from historical data");
        let rows = history::load_csv(&paths.historical_data)?;
        let detector = Detector::train(&rows, config.model.forest_params())?;
        detector.save(&paths.transformer, &paths.model)?;
        return Ok(ModelState::Ready(detector));
    }

    warn!(
        model = %paths.model.display(),
        historical = %paths.historical_data.display(),
        "no persisted model and no historical data; scoring is disabled"
    );
    Ok(ModelState::Uninitialized)
}
