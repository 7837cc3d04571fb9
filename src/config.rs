//! TOML configuration for anomalyd.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working local setup. The file is looked up at an explicit path, then
//! `$ANOMALYD_CONFIG`, then `/etc/anomalyd/anomalyd.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactBackend, S3Settings};
use crate::health::HealthFailurePolicy;
use crate::model::DetectorKind;
use crate::series::TrainingPolicy;
use crate::storage::PoolOptions;

pub const CONFIG_ENV: &str = "ANOMALYD_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/anomalyd/anomalyd.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
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
        config.validate()?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration the way the binary does. An explicit path
    /// must load; the fallbacks only warn.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{CONFIG_ENV} set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.training.min_points < 2 {
            bail!("training.min_points must be at least 2");
        }
        if self.telemetry.history_limit < 1 {
            bail!("telemetry.history_limit must be at least 1");
        }
        let k = self.model.sigma_multiplier;
        if !k.is_finite() || k <= 0.0 {
            bail!("model.sigma_multiplier must be a positive finite number");
        }
        if self.storage.pool_size == 0 {
            bail!("storage.pool_size must be at least 1");
        }
        let backend = self
            .storage
            .backend
            .parse::<ArtifactBackend>()
            .map_err(|e| anyhow::anyhow!("storage.backend: {e}"))?;
        if backend == ArtifactBackend::S3 && self.storage.s3.bucket.trim().is_empty() {
            bail!("storage.s3.bucket must be set when storage.backend is 's3'");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Registry database and artifact locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file holding the registry, version counters and latencies.
    pub database_path: PathBuf,
    /// Root directory for model and data artifacts.
    pub artifact_root: PathBuf,
    /// Artifact backend: `"local"` or `"s3"`.
    pub backend: String,
    /// Bucket and credentials for the `s3` backend.
    pub s3: S3Settings,
    /// How long a writer waits on the database lock before failing.
    pub busy_timeout_ms: u64,
    /// Maximum pooled connections.
    pub pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/anomalyd.db"),
            artifact_root: PathBuf::from("data/artifacts"),
            backend: "local".to_string(),
            s3: S3Settings::default(),
            busy_timeout_ms: 5000,
            pool_size: 16,
        }
    }
}

impl StorageConfig {
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_size: self.pool_size,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Fewest points a training dataset may have.
    pub min_points: usize,
    /// Reject datasets whose values are all identical.
    pub reject_constant: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let policy = TrainingPolicy::default();
        Self {
            min_points: policy.min_points,
            reject_constant: policy.reject_constant,
        }
    }
}

impl TrainingConfig {
    pub fn policy(&self) -> TrainingPolicy {
        TrainingPolicy {
            min_points: self.min_points,
            reject_constant: self.reject_constant,
        }
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub kind: DetectorKind,
    /// Deviations beyond this many standard deviations are anomalies.
    pub sigma_multiplier: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: DetectorKind::MeanStd,
            sigma_multiplier: 1.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// Latency samples retained per operation.
    pub history_limit: usize,
    /// What `/healthcheck` does when latency history cannot be read.
    pub health_failure_policy: HealthFailurePolicy,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            history_limit: 100,
            health_failure_policy: HealthFailurePolicy::Zeroed,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of the human formatter.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
