use serde::{Deserialize, Serialize};

use super::{Detector, ModelState};
use crate::error::{Error, Result};
use crate::series::{DataPoint, TrainingDataset};

pub const MODEL_NAME: &str = "anomaly_detection_model";

/// Running mean and population standard deviation of the training values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub std: f64,
    /// Multiple of `std` a point must exceed to be flagged.
    pub sigma_multiplier: f64,
}

impl Baseline {
    /// Welford's single pass keeps the result stable for large offsets.
    pub fn fit(values: impl Iterator<Item = f64>, sigma_multiplier: f64) -> Self {
        let mut n = 0u64;
        let mut mean = 0.0;
        let mut m2 = 0.0;
        for x in values {
            n += 1;
            let delta = x - mean;
            mean += delta / n as f64;
            m2 += delta * (x - mean);
        }
        let std = if n == 0 { 0.0 } else { (m2 / n as f64).sqrt() };
        Self {
            mean,
            std,
            sigma_multiplier,
        }
    }

    /// Absolute deviation from the mean, strictly above the threshold.
    pub fn is_anomaly(&self, value: f64) -> bool {
        (value - self.mean).abs() > self.sigma_multiplier * self.std
    }
}

/// Reference detector.
#[derive(Debug, Clone, Copy)]
pub struct MeanStdDetector {
    sigma_multiplier: f64,
}

impl MeanStdDetector {
    pub fn new(sigma_multiplier: f64) -> Self {
        Self { sigma_multiplier }
    }
}

impl Detector for MeanStdDetector {
    fn name(&self) -> &'static str {
        MODEL_NAME
    }

    fn fit(&self, dataset: &TrainingDataset) -> Result<ModelState> {
        let baseline = Baseline::fit(dataset.values(), self.sigma_multiplier);
        Ok(ModelState {
            model: MODEL_NAME.to_string(),
            parameters: serde_json::to_value(baseline)?,
            metrics: Some(serde_json::json!({ "points": dataset.len() })),
        })
    }

    fn predict(&self, state: &ModelState, point: &DataPoint) -> Result<bool> {
        let baseline: Baseline = serde_json::from_value(state.parameters.clone())
            .map_err(|e| Error::InconsistentState(format!("bad baseline parameters: {e}")))?;
        Ok(baseline.is_anomaly(point.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(values: &[f64]) -> TrainingDataset {
        let points = values
            .iter()
            .enumerate()
            .map(|(i, &value)| DataPoint {
                timestamp: i as i64,
                value,
            })
            .collect();
        TrainingDataset::new(points).unwrap()
    }

    fn point(value: f64) -> DataPoint {
        DataPoint {
            timestamp: 4,
            value,
        }
    }

    #[test]
    fn test_stats() {
        let b = Baseline::fit([1.0, 2.0, 3.0].into_iter(), 3.0);
        assert!((b.mean - 2.0).abs() < 1e-12);
        assert!((b.std - 0.816_496_58).abs() < 1e-6);
        assert!(b.is_anomaly(5.0));
        assert!(!b.is_anomaly(2.1));
    }

    #[test]
    fn test_spike_in_flat_history() {
        let det = MeanStdDetector::new(1.5);
        let state = det.fit(&dataset(&[10.0, 10.0, 10.0, 50.0])).unwrap();
        assert!(det.predict(&state, &point(50.0)).unwrap());
        assert!(!det.predict(&state, &point(10.0)).unwrap());
    }

    #[test]
    fn test_low_side_is_flagged() {
        let det = MeanStdDetector::new(3.0);
        let state = det.fit(&dataset(&[9.0, 10.0, 11.0, 10.0])).unwrap();
        assert!(det.predict(&state, &point(-40.0)).unwrap());
    }

    #[test]
    fn test_constant_baseline_flags_any_change() {
        let det = MeanStdDetector::new(3.0);
        let state = det.fit(&dataset(&[4.0, 4.0, 4.0])).unwrap();
        assert!(!det.predict(&state, &point(4.0)).unwrap());
        assert!(det.predict(&state, &point(4.001)).unwrap());
    }

    #[test]
    fn test_state_is_reproducible() {
        let det = MeanStdDetector::new(1.5);
        let ds = dataset(&[3.0, 7.5, 1.25, 9.0, 4.0]);
        let a = det.serialize(&det.fit(&ds).unwrap()).unwrap();
        let b = det.serialize(&det.fit(&ds).unwrap()).unwrap();
        assert_eq!(a, b);

        let restored = det.deserialize(&a).unwrap();
        for v in [0.0, 5.0, 12.0, 20.0] {
            assert_eq!(
                det.predict(&restored, &point(v)).unwrap(),
                det.predict(&det.fit(&ds).unwrap(), &point(v)).unwrap()
            );
        }
    }

    #[test]
    fn test_multiplier_travels_with_state() {
        let strict = MeanStdDetector::new(1.0);
        let state = strict.fit(&dataset(&[0.0, 2.0])).unwrap();
        // Same stored state, read back by a detector configured differently.
        let loose = MeanStdDetector::new(100.0);
        assert!(loose.predict(&state, &point(2.5)).unwrap());
    }
}
