//! Filesystem artifact store.
//!
//! The Build job publishes exactly one named file; the Deploy job consumes
//! it exactly once. The store keeps the bytes alongside a small JSON
//! sidecar (producing job, digest, size, consumed flag) so a fetched
//! artifact can be traced back to the run that produced it.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default store directory name under the state directory.
pub const ARTIFACTS_DIR: &str = "artifacts";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact name `{0}` is invalid: names must be a single path component")]
    InvalidName(String),
    #[error("artifact `{0}` not found in store")]
    NotFound(String),
    #[error("artifact `{0}` was already consumed")]
    AlreadyConsumed(String),
    #[error("artifact `{0}` is empty; refusing to publish a zero-byte file")]
    Empty(String),
    #[error("artifact source `{0}` does not exist")]
    MissingSource(PathBuf),
    #[error("artifact metadata for `{name}` is invalid: {source}")]
    Metadata {
        name: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sidecar metadata written next to every stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub producing_job: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub consumed: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    /// Names are joined into store paths, so anything that could escape
    /// the store root is rejected up front.
    fn validate_name(name: &str) -> Result<(), ArtifactError> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(ArtifactError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    /// Publish `src` under `name`. Rejects missing sources and zero-byte
    /// files: an empty build must fail loudly, not ship an empty artifact.
    pub fn publish(
        &self,
        name: &str,
        src: &Path,
        producing_job: &str,
    ) -> Result<ArtifactRecord, ArtifactError> {
        Self::validate_name(name)?;
        if !src.is_file() {
            return Err(ArtifactError::MissingSource(src.to_path_buf()));
        }

        let bytes = fs::read(src)?;
        if bytes.is_empty() {
            return Err(ArtifactError::Empty(name.to_string()));
        }

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());

        fs::write(self.data_path(name), &bytes)?;

        let record = ArtifactRecord {
            name: name.to_string(),
            producing_job: producing_job.to_string(),
            sha256: digest,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
            consumed: false,
        };
        self.write_record(&record)?;

        Ok(record)
    }

    /// Fetch `name` into `dest_dir`, marking it consumed. A second fetch of
    /// the same artifact fails with [`ArtifactError::AlreadyConsumed`].
    pub fn fetch(&self, name: &str, dest_dir: &Path) -> Result<PathBuf, ArtifactError> {
        let mut record = self.record(name)?;
        if record.consumed {
            return Err(ArtifactError::AlreadyConsumed(name.to_string()));
        }

        fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(name);
        fs::copy(self.data_path(name), &dest)?;

        record.consumed = true;
        self.write_record(&record)?;

        Ok(dest)
    }

    /// Read the sidecar record for `name`.
    pub fn record(&self, name: &str) -> Result<ArtifactRecord, ArtifactError> {
        Self::validate_name(name)?;
        let meta = self.meta_path(name);
        if !meta.exists() || !self.data_path(name).exists() {
            return Err(ArtifactError::NotFound(name.to_string()));
        }
        let content = fs::read_to_string(meta)?;
        serde_json::from_str(&content).map_err(|source| ArtifactError::Metadata {
            name: name.to_string(),
            source,
        })
    }

    fn write_record(&self, record: &ArtifactRecord) -> Result<(), ArtifactError> {
        let json = serde_json::to_string_pretty(record).map_err(|source| {
            ArtifactError::Metadata {
                name: record.name.clone(),
                source,
            }
        })?;
        fs::write(self.meta_path(&record.name), json)?;
        Ok(())
    }
}
