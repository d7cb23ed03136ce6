//! accesswatch -- anomaly detection over web server access logs.
//!
//! This crate provides the log parser, feature transformer, isolation-forest
//! outlier model, durable anomaly store, streaming ingestion loop and the
//! reviewer workflow that closes the loop on flagged sources.

pub mod config;
pub mod features;
pub mod history;
pub mod ingest;
pub mod mitigation;
pub mod model;
pub mod parser;
pub mod review;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::ingest::{IngestLoop, IngestStats};
use crate::mitigation::{CommandMitigation, Mitigation};
use crate::model::{Detector, ModelError, ModelState};
use crate::store::AnomalyStore;

/// Start one ingestion loop per configured log source and run until `cancel`
/// fires. Refuses to start without a trained model.
pub async fn watch(config: &Config, cancel: CancellationToken) -> Result<IngestStats> {
    if config.paths.log_files.is_empty() {
        bail!("no log sources configured");
    }

    // 1. Model
    let detector = match model::bootstrap(config)? {
        ModelState::Ready(d) => Arc::new(d),
        ModelState::Uninitialized => {
            return Err(ModelError::Uninitialized).context(
                "supply historical data or run `accesswatch train` before watching",
            )
        }
    };
    info!(pair_id = %detector.pair_id(), trained_at = %detector.trained_at(), "model ready");

    // 2. Store
    let store = Arc::new(AnomalyStore::open(&config.paths.anomaly_store)?);

    // 3. Mitigation hook
    let mitigation: Option<Arc<dyn Mitigation>> = CommandMitigation::from_config(&config.mitigation)?
        .map(|m| Arc::new(m) as Arc<dyn Mitigation>);
    if let Some(m) = &mitigation {
        warn!(command = m.name(), "automatic mitigation is enabled");
    }

    // 4. One loop per source. A loop that fails stops its siblings.
    let group = cancel.child_token();
    let mut handles = Vec::with_capacity(config.paths.log_files.len());
    for source in &config.paths.log_files {
        let mut ingest = IngestLoop::new(
            source.clone(),
            detector.clone(),
            store.clone(),
            config.ingest.poll_interval(),
        );
        if let Some(m) = &mitigation {
            ingest = ingest.with_mitigation(m.clone());
        }
        let group = group.clone();
        handles.push(tokio::spawn(async move {
            let result = ingest.run(group.clone()).await;
            if result.is_err() {
                group.cancel();
            }
            result
        }));
    }

    let mut total = IngestStats::default();
    let mut failed = 0usize;
    for (source, joined) in config
        .paths
        .log_files
        .iter()
        .zip(futures::future::join_all(handles).await)
    {
        match joined {
            Ok(Ok(stats)) => total.merge(&stats),
            Ok(Err(e)) => {
                failed += 1;
                error!(source = %source.display(), error = ?e, "ingestion loop failed");
            }
            Err(e) => {
                failed += 1;
                error!(source = %source.display(), error = %e, "ingestion task panicked");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} ingestion loop(s) failed", config.paths.log_files.len());
    }
    Ok(total)
}

/// Training input for [`train`].
#[derive(Debug, Clone)]
pub enum TrainingSource {
    Csv(PathBuf),
    AccessLog(PathBuf),
}

/// Fit a new detector from `source` and persist it to the configured paths,
/// replacing any existing pair.
pub fn train(config: &Config, source: &TrainingSource) -> Result<Detector> {
    let rows = match source {
        TrainingSource::Csv(path) => history::load_csv(path)?,
        TrainingSource::AccessLog(path) => history::load_access_log(path)?,
    };
    let detector = Detector::train(&rows, config.model.forest_params())?;
    detector.save(&config.paths.transformer, &config.paths.model)?;
    info!(
        model = %config.paths.model.display(),
        transformer = %config.paths.transformer.display(),
        "model pair saved"
    );
    Ok(detector)
}

/// What `accesswatch status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub model: ModelStatus,
    pub store: StoreStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelStatus {
    Ready {
        pair_id: String,
        trained_at: String,
        threshold: f64,
        contamination: f64,
    },
    Missing,
    Invalid {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub path: PathBuf,
    pub records: usize,
    pub unreviewed: usize,
    pub sources: usize,
    pub incomplete_tail: bool,
    pub skipped: usize,
}

/// Inspect the persisted model and the anomaly store without modifying them.
pub fn status(config: &Config) -> Result<Status> {
    let model = match Detector::load(&config.paths.transformer, &config.paths.model) {
        Ok(Some(d)) => ModelStatus::Ready {
            pair_id: d.pair_id().to_string(),
            trained_at: d.trained_at().to_rfc3339(),
            threshold: d.forest().threshold(),
            contamination: d.forest().params().contamination,
        },
        Ok(None) => ModelStatus::Missing,
        Err(e) => ModelStatus::Invalid {
            error: format!("{e:#}"),
        },
    };

    let store = store_status(&config.paths.anomaly_store)?;
    Ok(Status { model, store })
}

fn store_status(path: &Path) -> Result<StoreStatus> {
    if !path.exists() {
        return Ok(StoreStatus {
            path: path.to_path_buf(),
            records: 0,
            unreviewed: 0,
            sources: 0,
            incomplete_tail: false,
            skipped: 0,
        });
    }
    let store = AnomalyStore::open(path)?;
    let report = store.load()?;
    let incomplete_tail = report.incomplete_tail;
    let skipped = report.skipped;
    let records = report.records.len();
    let unreviewed = report.records.iter().filter(|r| !r.reviewed).count();
    let sources = report
        .records
        .iter()
        .map(|r| r.ip_address.as_str())
        .collect::<std::collections::HashSet<_>>()
        .len();
    Ok(StoreStatus {
        path: path.to_path_buf(),
        records,
        unreviewed,
        sources,
        incomplete_tail,
        skipped,
    })
}
