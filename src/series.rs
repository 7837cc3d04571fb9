//! Series identifiers, data points and training datasets.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Validated series key. Safe to embed in artifact paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SeriesId(String);

impl SeriesId {
    pub fn parse(raw: &str) -> Result<Self> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(Error::validation("series_id must be a non-empty string"));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(Error::validation(
                "series_id must contain only letters, numbers, '.', '_' or '-'",
            ));
        }
        if value.contains("..") {
            return Err(Error::validation("series_id cannot contain consecutive dots"));
        }
        if value.starts_with('.') {
            return Err(Error::validation("series_id cannot start with '.'"));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SeriesId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        SeriesId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// One sample of a univariate series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: i64,
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp: i64, value: f64) -> Result<Self> {
        if timestamp < 0 {
            return Err(Error::validation("timestamp must be greater than or equal to 0"));
        }
        if !value.is_finite() {
            return Err(Error::validation("value cannot be NaN or infinite"));
        }
        Ok(Self { timestamp, value })
    }

    /// Parse the transport form, where the timestamp is a digit-only string.
    pub fn from_wire(timestamp: &str, value: f64) -> Result<Self> {
        let ts = timestamp.trim();
        if ts.is_empty() {
            return Err(Error::validation("timestamp must be a non-empty string"));
        }
        if !ts.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::validation("timestamp must contain only digits"));
        }
        let parsed: i64 = ts
            .parse()
            .map_err(|_| Error::validation("timestamp is not a valid Unix timestamp"))?;
        Self::new(parsed, value)
    }
}

/// Ordered, validated training data. Construction enforces shape; the
/// acceptance floor is applied separately by [`TrainingPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingDataset {
    data: Vec<DataPoint>,
}

impl TrainingDataset {
    pub fn new(data: Vec<DataPoint>) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::validation("dataset must contain at least 2 data points"));
        }
        for p in &data {
            DataPoint::new(p.timestamp, p.value)?;
        }
        if data.windows(2).any(|w| w[1].timestamp <= w[0].timestamp) {
            return Err(Error::validation("dataset timestamps must be strictly increasing"));
        }
        Ok(Self { data })
    }

    /// Build from the parallel-array form used by the HTTP and CLI layers.
    pub fn from_columns(timestamps: &[i64], values: &[f64]) -> Result<Self> {
        if timestamps.len() != values.len() {
            return Err(Error::validation(
                "timestamps and values must have the same length",
            ));
        }
        let points = timestamps
            .iter()
            .zip(values)
            .map(|(&t, &v)| DataPoint::new(t, v))
            .collect::<Result<Vec<_>>>()?;
        Self::new(points)
    }

    pub fn points(&self) -> &[DataPoint] {
        &self.data
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().map(|p| p.value)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a stored dataset artifact, re-checking its invariants.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        #[derive(Deserialize)]
        struct Raw {
            data: Vec<DataPoint>,
        }
        let raw: Raw = serde_json::from_slice(bytes)?;
        Self::new(raw.data)
    }
}

/// Training preflight rules layered on top of dataset shape.
#[derive(Debug, Clone, Copy)]
pub struct TrainingPolicy {
    pub min_points: usize,
    pub reject_constant: bool,
}

impl Default for TrainingPolicy {
    fn default() -> Self {
        Self {
            min_points: 3,
            reject_constant: false,
        }
    }
}

impl TrainingPolicy {
    pub fn check(&self, dataset: &TrainingDataset) -> Result<()> {
        if dataset.len() < self.min_points {
            return Err(Error::validation(format!(
                "dataset must contain at least {} data points, got {}",
                self.min_points,
                dataset.len()
            )));
        }
        if self.reject_constant {
            let first = dataset.points()[0].value;
            if dataset.values().all(|v| v == first) {
                return Err(Error::validation("dataset cannot contain constant values only"));
            }
        }
        Ok(())
    }
}
