//! Read path: resolve a version, load its state, score a point.

use std::fmt;
use std::str::FromStr;

use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use crate::artifact::ArtifactStore;
use crate::error::{Error, Result};
use crate::model::Detector;
use crate::series::{DataPoint, SeriesId, TrainingDataset};
use crate::storage::{registry, ModelVersionRecord};

/// Which version a read targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSelector {
    #[default]
    Latest,
    Exact(u32),
}

impl VersionSelector {
    /// Accepts `latest`, an empty string, or digits with one optional
    /// leading `v`/`V`. Zero means latest.
    pub fn parse(raw: &str) -> Result<Self> {
        let value = raw.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        let digits = value
            .strip_prefix('v')
            .or_else(|| value.strip_prefix('V'))
            .unwrap_or(value);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::validation(format!(
                "version '{value}' must look like 1, v1 or V1"
            )));
        }
        let n: u32 = digits
            .parse()
            .map_err(|_| Error::validation(format!("version '{value}' is out of range")))?;
        Ok(match n {
            0 => Self::Latest,
            n => Self::Exact(n),
        })
    }
}

impl FromStr for VersionSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Exact(v) => write!(f, "v{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Prediction {
    pub anomaly: bool,
    pub version: u32,
}

/// Look up a committed record. NotFound if the series or version is absent.
pub fn resolve(
    conn: &Connection,
    series_id: &SeriesId,
    selector: VersionSelector,
) -> Result<ModelVersionRecord> {
    let found = match selector {
        VersionSelector::Latest => registry::get_latest(conn, series_id)?,
        VersionSelector::Exact(v) => registry::get_version(conn, series_id, v)?,
    };
    found.ok_or_else(|| match selector {
        VersionSelector::Latest => {
            Error::not_found(format!("no trained model for series '{series_id}'"))
        }
        VersionSelector::Exact(v) => {
            Error::not_found(format!("series '{series_id}' has no version {v}"))
        }
    })
}

/// Fetch an artifact a committed record points at. A dangling reference is
/// corruption, not a missing model.
fn load_referenced(store: &dyn ArtifactStore, record: &ModelVersionRecord, reference: &str) -> Result<bytes::Bytes> {
    store.get(reference).map_err(|e| match e {
        Error::NotFound(_) => Error::InconsistentState(format!(
            "artifact '{reference}' of series '{}' version {} is missing",
            record.series_id, record.version
        )),
        other => other,
    })
}

pub fn predict(
    conn: &Connection,
    store: &dyn ArtifactStore,
    detector: &dyn Detector,
    series_id: &SeriesId,
    point: &DataPoint,
    selector: VersionSelector,
) -> Result<Prediction> {
    let record = resolve(conn, series_id, selector)?;
    let model_ref = record.require_model_ref()?;
    let bytes = load_referenced(store, &record, model_ref)?;
    let state = detector.deserialize(&bytes)?;
    let anomaly = detector.predict(&state, point)?;

    debug!(
        series_id = %series_id,
        selector = %selector,
        version = record.version,
        anomaly,
        "prediction served"
    );
    Ok(Prediction {
        anomaly,
        version: record.version,
    })
}

/// Stored training data behind a version, for reporting and rendering.
pub fn training_data(
    conn: &Connection,
    store: &dyn ArtifactStore,
    series_id: &SeriesId,
    selector: VersionSelector,
) -> Result<(ModelVersionRecord, TrainingDataset)> {
    let record = resolve(conn, series_id, selector)?;
    let data_ref = record.require_data_ref()?;
    let bytes = load_referenced(store, &record, data_ref)?;
    let dataset = TrainingDataset::from_json_bytes(&bytes)
        .map_err(|e| Error::InconsistentState(format!("stored dataset is unreadable: {e}")))?;
    Ok((record, dataset))
}
