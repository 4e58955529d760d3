//! Artifact storage.
//!
//! Build outputs of every environment (manifest, build definitions, module
//! file) are kept in a filesystem store with checksummed index files.
//!
//! # Usage
//!
//! ```rust,ignore
//! use envforge::storage::ArtifactStore;
//!
//! let store = ArtifactStore::new("/srv/envforge/artifacts");
//! let record = store.add(&workspace.join("spack.yaml"), "users/alice/env").await?;
//! let bytes = store.retrieve("users/alice/env", &record.file).await?;
//! ```

pub mod artifacts;

pub use artifacts::{ArtifactRecord, ArtifactStore, StorageError};
