//! anomalyd -- versioned baseline anomaly-detection models for named time series.
//!
//! Trains a pluggable detector per series, keeps every fitted version with its
//! training data, and answers predictions against the latest or a chosen
//! version. Registry metadata lives in SQLite; model and data blobs live in a
//! write-once artifact store.

pub mod api;
pub mod artifact;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod model;
pub mod series;
pub mod storage;
pub mod telemetry;

pub use crate::engine::{ModelEngine, Prediction, TrainOutcome, VersionSelector};
pub use crate::error::{Error, Result};
pub use crate::series::{DataPoint, SeriesId, TrainingDataset};

use anyhow::Context;

/// Start the anomalyd HTTP service.
pub async fn serve(cfg: &config::Config) -> anyhow::Result<()> {
    tracing::info!(
        db = %cfg.storage.database_path.display(),
        artifacts = %cfg.storage.artifact_root.display(),
        "Initializing model engine"
    );
    let engine = ModelEngine::from_config(cfg)?;

    let addr: std::net::SocketAddr = cfg
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", cfg.server.bind))?;
    let app = api::router(api::state::AppState { engine });

    tracing::info!(%addr, "anomalyd listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
