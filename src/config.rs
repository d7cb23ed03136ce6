//! TOML configuration with environment overrides.
//!
//! Lookup order for the file: an explicit path, the `ACCESSWATCH_CONFIG`
//! environment variable, `/etc/accesswatch/accesswatch.toml`, and finally the
//! compiled-in defaults. Individual settings can then be overridden by the
//! environment variables listed on [`Config::apply_env`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use crate::model::ForestParams;

const SYSTEM_CONFIG_PATH: &str = "/etc/accesswatch/accesswatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub mitigation: MitigationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Resolve the file per the lookup order, apply environment overrides and
    /// validate. A config file that was named but cannot be loaded is an error.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, ConfigSource)> {
        Self::resolve_with(explicit, |key| std::env::var(key).ok())
    }

    fn resolve_with(
        explicit: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, ConfigSource)> {
        let (mut config, source) = Self::locate(explicit, &lookup)?;
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok((config, source))
    }

    fn locate(
        explicit: Option<&Path>,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, ConfigSource)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, ConfigSource::Explicit(path.to_path_buf())));
        }

        if let Some(env_path) = lookup("ACCESSWATCH_CONFIG") {
            let path = PathBuf::from(env_path);
            let config = Self::load(&path).context("ACCESSWATCH_CONFIG names a config file that could not be loaded")?;
            return Ok((config, ConfigSource::Env(path)));
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            let config = Self::load(system_path)?;
            return Ok((config, ConfigSource::System(system_path.to_path_buf())));
        }

        Ok((Self::default(), ConfigSource::Defaults))
    }

    /// Apply overrides from `LOG_FILE_PATH`, `HISTORICAL_DATA_PATH`,
    /// `MODEL_PATH`, `SCALER_PATH`, `ANOMALY_LOG_PATH`,
    /// `ACCESSWATCH_CONTAMINATION` and `ACCESSWATCH_POLL_INTERVAL_MS`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("LOG_FILE_PATH") {
            self.paths.log_files = vec![PathBuf::from(v)];
        }
        if let Some(v) = lookup("HISTORICAL_DATA_PATH") {
            self.paths.historical_data = PathBuf::from(v);
        }
        if let Some(v) = lookup("MODEL_PATH") {
            self.paths.model = PathBuf::from(v);
        }
        if let Some(v) = lookup("SCALER_PATH") {
            self.paths.transformer = PathBuf::from(v);
        }
        if let Some(v) = lookup("ANOMALY_LOG_PATH") {
            self.paths.anomaly_store = PathBuf::from(v);
        }
        if let Some(v) = lookup("ACCESSWATCH_CONTAMINATION") {
            self.model.contamination = v
                .parse()
                .with_context(|| format!("ACCESSWATCH_CONTAMINATION is not a number: {v}"))?;
        }
        if let Some(v) = lookup("ACCESSWATCH_POLL_INTERVAL_MS") {
            self.ingest.poll_interval_ms = v
                .parse()
                .with_context(|| format!("ACCESSWATCH_POLL_INTERVAL_MS is not an integer: {v}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let c = self.model.contamination;
        if !(c > 0.0 && c <= 0.5) {
            bail!("model.contamination must be in (0, 0.5], got {c}");
        }
        if self.model.n_estimators == 0 {
            bail!("model.n_estimators must be at least 1");
        }
        if self.model.max_samples == 0 {
            bail!("model.max_samples must be at least 1");
        }
        if self.ingest.poll_interval_ms == 0 {
            bail!("ingest.poll_interval_ms must be at least 1");
        }
        if self.mitigation.enabled && self.mitigation.command.is_empty() {
            bail!("mitigation.enabled is set but mitigation.command is empty");
        }
        Ok(())
    }

    /// Defaults with every path placed under `dir`.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            paths: PathsConfig {
                log_files: vec![dir.join("access.log")],
                historical_data: dir.join("access_logs.csv"),
                model: dir.join("iso_forest_model.json"),
                transformer: dir.join("scaler.json"),
                anomaly_store: dir.join("anomaly_feedback.json"),
            },
            ..Self::default()
        }
    }
}

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    Env(PathBuf),
    System(PathBuf),
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Explicit(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::Env(p) => write!(f, "{} (ACCESSWATCH_CONFIG)", p.display()),
            ConfigSource::System(p) => write!(f, "{}", p.display()),
            ConfigSource::Defaults => f.write_str("compiled-in defaults"),
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Access logs to tail. One ingestion loop runs per file.
    pub log_files: Vec<PathBuf>,
    /// CSV of past requests used when no persisted model exists.
    pub historical_data: PathBuf,
    /// Persisted isolation forest.
    pub model: PathBuf,
    /// Persisted transformer state (encoders, medians, scaler).
    pub transformer: PathBuf,
    /// JSON-lines anomaly feedback queue.
    pub anomaly_store: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_files: vec![PathBuf::from("/var/log/nginx/access.log")],
            historical_data: PathBuf::from("access_logs.csv"),
            model: PathBuf::from("iso_forest_model.json"),
            transformer: PathBuf::from("scaler.json"),
            anomaly_store: PathBuf::from("anomaly_feedback.json"),
        }
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Expected fraction of anomalous rows in training data.
    pub contamination: f64,
    pub n_estimators: usize,
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let params = ForestParams::default();
        Self {
            contamination: params.contamination,
            n_estimators: params.n_estimators,
            max_samples: params.max_samples,
            seed: params.seed,
        }
    }
}

impl ModelConfig {
    pub fn forest_params(&self) -> ForestParams {
        ForestParams {
            n_estimators: self.n_estimators,
            max_samples: self.max_samples,
            contamination: self.contamination,
            seed: self.seed,
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// How long to wait for new log content before polling again.
    pub poll_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl IngestConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Mitigation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MitigationConfig {
    pub enabled: bool,
    /// Program and arguments; `{ip}` is replaced with the flagged source.
    pub command: Vec<String>,
    pub timeout_sec: u64,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: ["iptables", "-A", "INPUT", "-s", "{ip}", "-j", "DROP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout_sec: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
