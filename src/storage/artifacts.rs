//! Artifact storage for environment build outputs.
//!
//! Manifests, build definitions and module files are copied into
//! `<base>/<environment name>/`. Each environment directory carries an
//! `index.json` recording the SHA-256 checksum of every stored file.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;

/// Name of the per-environment index file.
const INDEX_FILENAME: &str = "index.json";

/// Errors that can occur during artifact storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Index file could not be read or written.
    #[error("Index error: {0}")]
    Index(#[from] serde_json::Error),

    /// Source file does not exist.
    #[error("Artifact source not found: {0}")]
    SourceNotFound(PathBuf),

    /// Artifact is not recorded in the index.
    #[error("Artifact not found: {name}/{file}")]
    NotFound { name: String, file: String },

    /// Checksum verification failed.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Source path has no file name.
    #[error("Invalid artifact path: {0}")]
    InvalidPath(PathBuf),
}

/// Metadata of one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub file: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub added_at: DateTime<Utc>,
}

/// Filesystem artifact store.
pub struct ArtifactStore {
    base_path: PathBuf,
    index_lock: Mutex<()>,
}

impl ArtifactStore {
    /// Creates a store rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            index_lock: Mutex::new(()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding the artifacts of environment `name`.
    ///
    /// Only plain path components of `name` are kept, so the directory never
    /// leaves the store.
    pub fn environment_dir(&self, name: &str) -> PathBuf {
        let mut dir = self.base_path.clone();
        dir.extend(Path::new(name.trim()).components().filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        }));
        dir
    }

    /// Copies `src` into the directory of environment `name`.
    ///
    /// Re-adding a file replaces the stored copy and its index entry.
    ///
    /// # Arguments
    ///
    /// * `src` - File to store
    /// * `name` - Environment name the file belongs to
    ///
    /// # Errors
    ///
    /// Returns `SourceNotFound` if `src` does not exist.
    pub async fn add(&self, src: &Path, name: &str) -> Result<ArtifactRecord, StorageError> {
        let file = src
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::InvalidPath(src.to_path_buf()))?;

        let data = fs::read(src).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::SourceNotFound(src.to_path_buf())
            } else {
                StorageError::Io(e)
            }
        })?;

        let dir = self.environment_dir(name);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(&file), &data).await?;

        let record = ArtifactRecord {
            file: file.clone(),
            checksum: Self::compute_checksum(&data),
            size_bytes: data.len() as u64,
            added_at: Utc::now(),
        };

        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index(&dir).await?;
        index.insert(file, record.clone());
        fs::write(dir.join(INDEX_FILENAME), serde_json::to_vec_pretty(&index)?).await?;

        tracing::debug!(
            environment = %name,
            file = %record.file,
            checksum = %record.checksum,
            "Stored artifact"
        );
        Ok(record)
    }

    /// Lists stored artifacts of environment `name`, keyed by file name.
    pub async fn list(&self, name: &str) -> Result<BTreeMap<String, ArtifactRecord>, StorageError> {
        self.read_index(&self.environment_dir(name)).await
    }

    /// Reads a stored artifact, verifying its checksum.
    pub async fn retrieve(&self, name: &str, file: &str) -> Result<Vec<u8>, StorageError> {
        let dir = self.environment_dir(name);
        let index = self.read_index(&dir).await?;
        let record = index.get(file).ok_or_else(|| StorageError::NotFound {
            name: name.to_string(),
            file: file.to_string(),
        })?;

        let data = fs::read(dir.join(file)).await?;
        let actual = Self::compute_checksum(&data);
        if actual != record.checksum {
            return Err(StorageError::ChecksumMismatch {
                expected: record.checksum.clone(),
                actual,
            });
        }
        Ok(data)
    }

    async fn read_index(&self, dir: &Path) -> Result<BTreeMap<String, ArtifactRecord>, StorageError> {
        match fs::read(dir.join(INDEX_FILENAME)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Computes the SHA-256 checksum of data.
    pub fn compute_checksum(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }
}
