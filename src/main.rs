use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use accesswatch::config::{Config, LogFormat, LoggingConfig};
use accesswatch::review::{ReviewDecision, ReviewWorkflow};
use accesswatch::store::AnomalyStore;
use accesswatch::{ModelStatus, TrainingSource};

#[derive(Parser)]
#[command(
    name = "accesswatch",
    about = "Anomaly detection for web server access logs",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail access logs and record anomalous requests
    Watch {
        /// Log file to follow (repeatable; overrides the config)
        #[arg(long = "log-file")]
        log_files: Vec<PathBuf>,
    },

    /// Fit a new model pair and save it, replacing any existing one
    Train {
        /// Historical CSV export (defaults to paths.historical_data)
        #[arg(long, conflicts_with = "from_log")]
        from: Option<PathBuf>,

        /// Bootstrap from an existing access log instead
        #[arg(long)]
        from_log: Option<PathBuf>,
    },

    /// Review flagged sources
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Show model and anomaly store state
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ReviewAction {
    /// List sources with unreviewed anomalies
    List {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Submit verdicts for one or more sources
    Submit {
        /// Mark a source as a confirmed anomaly
        #[arg(long = "true-positive", value_name = "IP")]
        true_positive: Vec<String>,

        /// Mark a source as a false alarm
        #[arg(long = "false-positive", value_name = "IP")]
        false_positive: Vec<String>,

        /// Close a source without a verdict
        #[arg(long, value_name = "IP")]
        dismiss: Vec<String>,

        /// JSON object mapping source to verdict
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Prompt for a verdict on each pending source
    Interactive,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Tracing is configured from the file, so resolution errors go to stderr
    // via the returned error.
    let (config, source) = Config::resolve(cli.config.as_deref()).context("invalid configuration")?;
    init_tracing(&config.logging);
    tracing::info!(%source, "configuration loaded");

    match cli.command {
        Commands::Watch { log_files } => {
            let mut config = config;
            if !log_files.is_empty() {
                config.paths.log_files = log_files;
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Received shutdown signal");
                    on_signal.cancel();
                }
            });

            tracing::info!(sources = config.paths.log_files.len(), "Starting accesswatch");
            let stats = accesswatch::watch(&config, cancel).await.map_err(|e| {
                tracing::error!(error = ?e, "accesswatch stopped with an error");
                e
            })?;
            tracing::info!(
                lines = stats.lines,
                anomalies = stats.anomalies,
                parse_failures = stats.parse_failures,
                "accesswatch stopped"
            );
        }
        Commands::Train { from, from_log } => {
            let source = match (from, from_log) {
                (_, Some(log)) => TrainingSource::AccessLog(log),
                (Some(csv), None) => TrainingSource::Csv(csv),
                (None, None) => TrainingSource::Csv(config.paths.historical_data.clone()),
            };
            let detector = accesswatch::train(&config, &source)?;
            println!("Trained model pair {}", detector.pair_id());
            println!("  model:       {}", config.paths.model.display());
            println!("  transformer: {}", config.paths.transformer.display());
            println!("  threshold:   {:.4}", detector.forest().threshold());
        }
        Commands::Review { action } => {
            let store = Arc::new(AnomalyStore::open(&config.paths.anomaly_store)?);
            let review = ReviewWorkflow::new(store);

            match action {
                ReviewAction::List { json } => {
                    let pending = review.pending()?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&pending)?);
                    } else if pending.is_empty() {
                        println!("No anomalies pending review.");
                    } else {
                        println!("{:<40} | {:<10} | {:<9} | Last request", "Source", "Detections", "Max score");
                        println!("{:-<40}-|-{:-<10}-|-{:-<9}-|-{:-<30}", "", "", "", "");
                        for source in &pending {
                            let last = &source.records[source.records.len() - 1].anomaly_data;
                            println!(
                                "{:<40} | {:<10} | {:<9.4} | {} {} -> {}",
                                source.ip_address,
                                source.records.len(),
                                source.max_score(),
                                last.method,
                                last.resource,
                                last.status_code
                            );
                        }
                    }
                }
                ReviewAction::Submit {
                    true_positive,
                    false_positive,
                    dismiss,
                    file,
                } => {
                    let mut verdicts: HashMap<String, ReviewDecision> = match file {
                        Some(path) => {
                            let text = std::fs::read_to_string(&path)
                                .with_context(|| format!("failed to read {}", path.display()))?;
                            serde_json::from_str(&text)
                                .with_context(|| format!("failed to parse verdicts in {}", path.display()))?
                        }
                        None => HashMap::new(),
                    };
                    for ip in true_positive {
                        verdicts.insert(ip, ReviewDecision::TruePositive);
                    }
                    for ip in false_positive {
                        verdicts.insert(ip, ReviewDecision::FalsePositive);
                    }
                    for ip in dismiss {
                        verdicts.insert(ip, ReviewDecision::Dismissed);
                    }
                    if verdicts.is_empty() {
                        bail!("no verdicts given; use --true-positive, --false-positive, --dismiss or --file");
                    }

                    let summary = review.submit(&verdicts)?;
                    println!("Updated {} record(s); {} still pending.", summary.updated, summary.still_pending);
                    for ip in &summary.unmatched_sources {
                        println!("  no pending records for {ip}");
                    }
                }
                ReviewAction::Interactive => {
                    let stdin = std::io::stdin();
                    review.interactive(stdin.lock(), std::io::stdout())?;
                }
            }
        }
        Commands::Status { json } => {
            let status = accesswatch::status(&config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("\n=== accesswatch status ===");
                match &status.model {
                    ModelStatus::Ready {
                        pair_id,
                        trained_at,
                        threshold,
                        contamination,
                    } => {
                        println!("Model:         ready (pair {pair_id})");
                        println!("Trained at:    {trained_at}");
                        println!("Threshold:     {threshold:.4}");
                        println!("Contamination: {contamination}");
                    }
                    ModelStatus::Missing => println!("Model:         not trained"),
                    ModelStatus::Invalid { error } => println!("Model:         INVALID ({error})"),
                }
                let s = &status.store;
                println!("Store:         {}", s.path.display());
                println!("Records:       {} ({} unreviewed, {} sources)", s.records, s.unreviewed, s.sources);
                if s.incomplete_tail || s.skipped > 0 {
                    println!("Damaged:       {} skipped line(s), incomplete tail: {}", s.skipped, s.incomplete_tail);
                }
                println!();
            }
        }
    }

    Ok(())
}
