//! Error types for envforge operations.
//!
//! Defines the error taxonomy shared by every pipeline stage:
//! - Configuration problems detected before any external command runs
//! - External command failures (package manager, container builder, registry client)
//! - Manifest loading and patching
//! - Logging outside of an active coordinator/worker execution
//! - Stage sequencing and context transfer between processes

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::scheduler::QueueError;
use crate::storage::StorageError;

/// Coarse classification of a pipeline failure.
///
/// Failures cross process boundaries as `(kind, message)` pairs, so the kind
/// is serializable while the full error is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    InvalidModel,
    BuildStepFailed,
    ManifestPatch,
    InvalidLoggingContext,
    StageOrder,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::InvalidModel => "invalid_model",
            ErrorKind::BuildStepFailed => "build_step_failed",
            ErrorKind::ManifestPatch => "manifest_patch",
            ErrorKind::InvalidLoggingContext => "invalid_logging_context",
            ErrorKind::StageOrder => "stage_order",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

/// Errors that can occur while running the build pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Required settings are missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The environment request itself is unusable.
    #[error("Invalid environment model: {0}")]
    InvalidModel(String),

    /// An external command exited non-zero or could not be started.
    #[error("Build step '{stage}' failed running `{command}`: {reason}")]
    BuildStepFailed {
        stage: String,
        command: String,
        reason: String,
    },

    /// The manifest file is missing or cannot be parsed.
    #[error("Manifest patch failed for '{path}': {reason}")]
    ManifestPatch { path: String, reason: String },

    /// A log sink was requested outside of an active execution.
    #[error("Logging is only available inside coordinator and worker executions")]
    InvalidLoggingContext,

    /// The container builder was driven out of order.
    #[error("Stage order violation: expected builder state '{expected}', found '{found}'")]
    StageOrder { expected: String, found: String },

    /// A context payload was produced by an incompatible schema.
    #[error("Unsupported context schema version {found} (supported: {supported})")]
    SchemaVersion { found: u32, supported: u32 },

    /// A stage failed on a worker; only its classification and message survive transfer.
    #[error("Stage '{stage}' failed ({kind}): {message}")]
    StageFailed {
        stage: String,
        kind: ErrorKind,
        message: String,
    },

    /// The requested run is not known to the coordinator.
    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Artifact storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PipelineError {
    /// Builds a `BuildStepFailed` error.
    pub fn build_step(
        stage: impl Into<String>,
        command: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        PipelineError::BuildStepFailed {
            stage: stage.into(),
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Builds a `ManifestPatch` error.
    pub fn manifest(path: &std::path::Path, reason: impl Into<String>) -> Self {
        PipelineError::ManifestPatch {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the serializable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Configuration(_) => ErrorKind::Configuration,
            PipelineError::InvalidModel(_) => ErrorKind::InvalidModel,
            PipelineError::BuildStepFailed { .. } => ErrorKind::BuildStepFailed,
            PipelineError::ManifestPatch { .. } => ErrorKind::ManifestPatch,
            PipelineError::InvalidLoggingContext => ErrorKind::InvalidLoggingContext,
            PipelineError::StageOrder { .. } => ErrorKind::StageOrder,
            PipelineError::StageFailed { kind, .. } => *kind,
            PipelineError::Template(_) => ErrorKind::Configuration,
            PipelineError::SchemaVersion { .. }
            | PipelineError::RunNotFound(_)
            | PipelineError::Queue(_)
            | PipelineError::Storage(_)
            | PipelineError::Io(_)
            | PipelineError::Json(_)
            | PipelineError::Yaml(_) => ErrorKind::Internal,
        }
    }
}
