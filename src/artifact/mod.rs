//! Write-once artifact storage for model states and training datasets.
//!
//! Keys are a pure function of (series, version, kind) so any replica can
//! recompute where an artifact lives. A backend hands back a resolved
//! reference from `put`; that reference is what the registry stores.

pub mod local;
pub mod s3;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::series::SeriesId;

pub use self::local::LocalArtifactStore;
pub use self::s3::{S3ArtifactStore, S3Settings};

/// What an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Model,
    Data,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical, root-relative artifact location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub kind: ArtifactKind,
    pub series_id: SeriesId,
    pub version: u32,
}

impl ArtifactKey {
    pub fn new(series_id: &SeriesId, version: u32, kind: ArtifactKind) -> Self {
        Self {
            kind,
            series_id: series_id.clone(),
            version,
        }
    }
}

impl fmt::Display for ArtifactKey {
    /// `{kind}/{series_id}/{series_id}_{kind}_v{version}`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{kind}/{sid}/{sid}_{kind}_v{v}",
            kind = self.kind,
            sid = self.series_id,
            v = self.version
        )
    }
}

/// Blob storage contract. Implementations must be safe to call from many
/// blocking tasks at once.
pub trait ArtifactStore: Send + Sync {
    /// Backend name for logs.
    fn backend(&self) -> &'static str;

    /// Physical reference an artifact stored under `key` resolves to.
    fn resolve(&self, key: &ArtifactKey) -> String;

    /// Durably write `bytes` under `key` and return its reference.
    /// Fails with `ArtifactConflict` if the key is already taken.
    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<String>;

    /// Read an artifact by the reference `put` returned.
    fn get(&self, reference: &str) -> Result<Bytes>;

    fn exists(&self, reference: &str) -> Result<bool>;
}

/// Supported artifact backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactBackend {
    Local,
    S3,
}

impl std::str::FromStr for ArtifactBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            other => Err(Error::validation(format!(
                "unsupported artifact backend '{other}'"
            ))),
        }
    }
}

/// Build the configured backend. `root` is used by `Local`, `s3` by `S3`.
///
/// The S3 backend binds to the current tokio runtime, so it must be opened
/// from inside one.
pub fn open_store(
    backend: ArtifactBackend,
    root: &std::path::Path,
    s3: &S3Settings,
) -> Result<Arc<dyn ArtifactStore>> {
    match backend {
        ArtifactBackend::Local => Ok(Arc::new(LocalArtifactStore::new(root)?)),
        ArtifactBackend::S3 => {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                Error::validation("the s3 artifact backend needs a running tokio runtime")
            })?;
            Ok(Arc::new(S3ArtifactStore::new(s3, runtime)?))
        }
    }
}
