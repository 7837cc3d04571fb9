//! Local filesystem artifact backend.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use super::{ArtifactKey, ArtifactStore};
use crate::error::{Error, Result};

/// Stores artifacts as plain files under a root directory:
/// `{root}/{kind}/{series_id}/{series_id}_{kind}_v{version}`.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(key.kind.as_str())
            .join(key.series_id.as_str())
            .join(format!("{}_{}_v{}", key.series_id, key.kind, key.version))
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn resolve(&self, key: &ArtifactKey) -> String {
        self.path_for(key).to_string_lossy().into_owned()
    }

    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<String> {
        let path = self.path_for(key);
        let dir = path
            .parent()
            .ok_or_else(|| Error::Storage(format!("artifact path has no parent: {}", path.display())))?;
        fs::create_dir_all(dir)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::ArtifactConflict {
                    key: path.display().to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(bytes)?;
        file.sync_all()?;

        // Make the new directory entry durable too.
        #[cfg(unix)]
        File::open(dir)?.sync_all()?;

        debug!(path = %path.display(), bytes = bytes.len(), "artifact written");
        Ok(path.to_string_lossy().into_owned())
    }

    fn get(&self, reference: &str) -> Result<Bytes> {
        match fs::read(reference) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::not_found(format!("artifact '{reference}' does not exist")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, reference: &str) -> Result<bool> {
        Ok(Path::new(reference).try_exists()?)
    }
}
