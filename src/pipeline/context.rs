//! Run context passed between pipeline stages.
//!
//! The context is a small, versioned document of plain fields. It is encoded
//! to JSON at every stage boundary so the next stage can run in another
//! process; builders and log sinks are rebuilt from it on the worker.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::container::BuilderState;
use crate::error::PipelineError;

/// Current context schema version.
pub const CONTEXT_SCHEMA_VERSION: u32 = 1;

/// What the caller asked to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentModel {
    #[serde(default)]
    pub description: String,
    pub packages: Vec<String>,
}

impl EnvironmentModel {
    pub fn new<S: Into<String>>(description: impl Into<String>, packages: impl IntoIterator<Item = S>) -> Self {
        Self {
            description: description.into(),
            packages: packages.into_iter().map(Into::into).collect(),
        }
    }

    /// Reads a model from a YAML document with `description` and `packages`.
    pub fn from_yaml_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidModel(format!("cannot read {}: {}", path.display(), e))
        })?;
        let model: Self = serde_yaml::from_str(&content)
            .map_err(|e| PipelineError::InvalidModel(format!("{}: {}", path.display(), e)))?;
        model.validate()?;
        Ok(model)
    }

    /// Rejects empty package lists and blank package names.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.packages.is_empty() {
            return Err(PipelineError::InvalidModel(
                "at least one package is required".to_string(),
            ));
        }
        if self.packages.iter().any(|p| p.trim().is_empty()) {
            return Err(PipelineError::InvalidModel(
                "package names must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// State of one run, threaded through every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentContext {
    pub schema_version: u32,
    /// Run identifier, stable across all stages.
    pub id: Uuid,
    pub name: String,
    /// Workspace owned by this run.
    pub workspace: PathBuf,
    pub model: EnvironmentModel,
    /// Set by the publish stage, never changed afterwards.
    #[serde(default)]
    pub image_version: Option<String>,
    #[serde(default)]
    pub builder_state: BuilderState,
    /// Stages that finished successfully, in order.
    #[serde(default)]
    pub completed_stages: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnvironmentContext {
    /// Creates the context for a new run whose workspace lives under `environments_root`.
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        environments_root: &Path,
        model: EnvironmentModel,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CONTEXT_SCHEMA_VERSION,
            id,
            name: name.into(),
            workspace: environments_root.join(id.to_string()),
            model,
            image_version: None,
            builder_state: BuilderState::NotStarted,
            completed_stages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Records the image version. A version already set is kept.
    pub fn set_image_version(&mut self, version: impl Into<String>) -> &str {
        self.image_version.get_or_insert_with(|| version.into())
    }

    /// Marks `stage` as finished.
    pub fn complete_stage(&mut self, stage: &str) {
        self.completed_stages.push(stage.to_string());
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Encodes the context for transfer.
    pub fn to_payload(&self) -> Result<serde_json::Value, PipelineError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes a transferred context.
    ///
    /// # Errors
    ///
    /// Returns `SchemaVersion` when the payload was written by another schema
    /// version, or a JSON error when it is malformed.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, PipelineError> {
        let found = payload
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        if found != CONTEXT_SCHEMA_VERSION {
            return Err(PipelineError::SchemaVersion {
                found,
                supported: CONTEXT_SCHEMA_VERSION,
            });
        }
        Ok(serde_json::from_value(payload.clone())?)
    }
}
