//! Health and reporting: trained-series count plus latency summaries.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::telemetry::{LatencySummary, MetricsSink, OperationKind};

/// What to do when latency history cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthFailurePolicy {
    /// Report zeroed latencies and log a warning.
    #[default]
    Zeroed,
    /// Fail the health request with a storage error.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub series_trained: u64,
    pub inference_latency_ms: LatencySummary,
    pub training_latency_ms: LatencySummary,
}

impl HealthReport {
    pub fn build(
        series_trained: u64,
        sink: &dyn MetricsSink,
        policy: HealthFailurePolicy,
    ) -> Result<Self> {
        Ok(Self {
            series_trained,
            inference_latency_ms: summarize(sink, OperationKind::Predict, policy)?,
            training_latency_ms: summarize(sink, OperationKind::Train, policy)?,
        })
    }
}

fn summarize(
    sink: &dyn MetricsSink,
    op: OperationKind,
    policy: HealthFailurePolicy,
) -> Result<LatencySummary> {
    match sink.latencies(op) {
        Ok(samples) => Ok(LatencySummary::from_samples(&samples)),
        Err(e) => match policy {
            HealthFailurePolicy::Zeroed => {
                warn!(operation = %op, error = %e, "latency history unavailable, reporting zeros");
                Ok(LatencySummary::default())
            }
            HealthFailurePolicy::Unavailable => Err(Error::Storage(format!(
                "latency history for {op} is unavailable: {e}"
            ))),
        },
    }
}
