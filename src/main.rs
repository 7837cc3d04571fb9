use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use anomalyd::config::{Config, LoggingConfig};
use anomalyd::{DataPoint, ModelEngine, SeriesId, TrainingDataset, VersionSelector};

#[derive(Parser)]
#[command(
    name = "anomalyd",
    about = "Versioned baseline anomaly detection for named time series",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true, env = "ANOMALYD_CONFIG")]
    config: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Train a new version of a series from a JSON file
    Train {
        /// Series identifier
        series_id: String,

        /// File with {"timestamps": [...], "values": [...]}
        #[arg(long)]
        file: PathBuf,
    },

    /// Score one point against a trained version
    Predict {
        /// Series identifier
        series_id: String,

        /// Unix timestamp of the point
        #[arg(long)]
        timestamp: String,

        /// Observed value
        #[arg(long, allow_negative_numbers = true)]
        value: f64,

        /// Version to use: latest, 3, v3 or V3
        #[arg(long, default_value = "latest")]
        version: String,
    },

    /// Show registry metadata for a series
    Show {
        /// Series identifier
        series_id: String,

        /// Version to show: latest, 3, v3 or V3
        #[arg(long, default_value = "latest")]
        version: String,
    },

    /// Print trained-series count and latency summaries
    Health,
}

#[derive(Deserialize)]
struct TrainFile {
    timestamps: Vec<i64>,
    values: Vec<f64>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = Config::discover(cli.config.as_deref())?;
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            tracing::info!(bind = %cfg.server.bind, "Starting anomalyd");
            anomalyd::serve(&cfg).await?;
        }
        Commands::Train { series_id, file } => {
            let engine = ModelEngine::from_config(&cfg)?;
            let series_id = SeriesId::parse(&series_id)?;
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let body: TrainFile = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            let dataset = TrainingDataset::from_columns(&body.timestamps, &body.values)?;

            let outcome = engine.train(&series_id, dataset).await;
            engine.flush_metrics().await;
            let outcome = outcome?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!(
                    "Trained '{}' version {} on {} points.",
                    outcome.series_id, outcome.version, outcome.points_used
                );
            }
        }
        Commands::Predict {
            series_id,
            timestamp,
            value,
            version,
        } => {
            let engine = ModelEngine::from_config(&cfg)?;
            let series_id = SeriesId::parse(&series_id)?;
            let point = DataPoint::from_wire(&timestamp, value)?;
            let selector = VersionSelector::parse(&version)?;

            let prediction = engine.predict(&series_id, point, selector).await;
            engine.flush_metrics().await;
            let prediction = prediction?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&prediction)?);
            } else {
                let verdict = if prediction.anomaly { "ANOMALY" } else { "normal" };
                println!(
                    "{} @ {} -> {} (model v{})",
                    value, timestamp, verdict, prediction.version
                );
            }
        }
        Commands::Show { series_id, version } => {
            let engine = ModelEngine::from_config(&cfg)?;
            let series_id = SeriesId::parse(&series_id)?;
            let selector = VersionSelector::parse(&version)?;

            let record = engine.resolve(&series_id, selector).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("{:<12} | {}", "Series", record.series_id);
                println!("{:<12} | {}", "Version", record.version);
                println!("{:<12} | {}", "Model", record.model_ref.as_deref().unwrap_or("-"));
                println!("{:<12} | {}", "Data", record.data_ref.as_deref().unwrap_or("-"));
                println!("{:<12} | {}", "Created", record.created_at.to_rfc3339());
            }
        }
        Commands::Health => {
            let engine = ModelEngine::from_config(&cfg)?;
            let report = engine.health().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Series trained: {}", report.series_trained);
                println!("{:<10} | {:>10} | {:>10}", "Operation", "avg ms", "p95 ms");
                println!("{:-<10}-|-{:->10}-|-{:->10}", "", "", "");
                for (name, s) in [
                    ("train", report.training_latency_ms),
                    ("predict", report.inference_latency_ms),
                ] {
                    println!("{:<10} | {:>10.2} | {:>10.2}", name, s.avg, s.p95);
                }
            }
        }
    }

    Ok(())
}
