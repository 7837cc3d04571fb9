//! Pluggable detection capability: fit / predict / serialize / deserialize.
//!
//! Orchestrators only see `dyn Detector`; the concrete strategy is picked from
//! configuration by [`build_detector`].

pub mod baseline;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::series::{DataPoint, TrainingDataset};

pub use self::baseline::MeanStdDetector;

/// Serialized output of a fit. Only the detector named in `model` knows how
/// to read `parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub model: String,
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

pub trait Detector: Send + Sync {
    /// Tag written into every state this detector produces.
    fn name(&self) -> &'static str;

    /// Pure and deterministic for identical input.
    fn fit(&self, dataset: &TrainingDataset) -> Result<ModelState>;

    fn predict(&self, state: &ModelState, point: &DataPoint) -> Result<bool>;

    fn serialize(&self, state: &ModelState) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(state)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<ModelState> {
        let state: ModelState = serde_json::from_slice(bytes)
            .map_err(|e| Error::InconsistentState(format!("unreadable model state: {e}")))?;
        if state.model != self.name() {
            return Err(Error::InconsistentState(format!(
                "model state was produced by '{}', active detector is '{}'",
                state.model,
                self.name()
            )));
        }
        Ok(state)
    }
}

/// Detectors selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    MeanStd,
}

pub fn build_detector(kind: DetectorKind, sigma_multiplier: f64) -> Arc<dyn Detector> {
    match kind {
        DetectorKind::MeanStd => Arc::new(MeanStdDetector::new(sigma_multiplier)),
    }
}
