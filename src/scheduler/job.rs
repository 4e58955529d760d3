//! Job definitions for the scheduler.
//!
//! This module defines the types exchanged between the coordinator and the
//! workers:
//!
//! - `StageJob`: one pipeline stage to execute for one run
//! - `JobOutcome`: what the stage produced
//! - `JobResult`: the outcome plus execution metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// A pipeline stage queued for execution.
///
/// The context is carried as an opaque JSON document; the worker decodes
/// and validates it before running the stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageJob {
    /// Unique identifier for this job.
    pub id: Uuid,
    /// Run the stage belongs to.
    pub run_id: Uuid,
    /// Stage name.
    pub stage: String,
    /// Serialized run context.
    pub context: serde_json::Value,
    /// When this job was created.
    pub created_at: DateTime<Utc>,
}

impl StageJob {
    /// Creates a new job for `stage` of `run_id`.
    pub fn new(run_id: Uuid, stage: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            stage: stage.into(),
            context,
            created_at: Utc::now(),
        }
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// What a stage produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The stage succeeded and returned the updated context.
    Completed { context: serde_json::Value },
    /// The stage failed.
    ///
    /// The context reflects the progress made before the failure, when the
    /// worker could decode it.
    Failed {
        kind: ErrorKind,
        message: String,
        #[serde(default)]
        context: Option<serde_json::Value>,
    },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }
}

/// Result of a job execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    /// ID of the job that was executed.
    pub job_id: Uuid,
    pub outcome: JobOutcome,
    /// Worker that executed the job.
    pub worker_id: String,
    /// Execution duration in milliseconds.
    pub duration_ms: u64,
    /// When the job finished.
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    pub fn new(job_id: Uuid, outcome: JobOutcome, worker_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            job_id,
            outcome,
            worker_id: worker_id.into(),
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_new() {
        let run_id = Uuid::new_v4();
        let job = StageJob::new(run_id, "publish", json!({"name": "demo"}));
        assert_eq!(job.run_id, run_id);
        assert_eq!(job.stage, "publish");
        assert_ne!(job.id, run_id);
        assert!(job.age().num_seconds() < 5);
    }

    #[test]
    fn test_outcome_wire_format() {
        let failed = JobOutcome::Failed {
            kind: ErrorKind::BuildStepFailed,
            message: "exit code 1".to_string(),
            context: None,
        };
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["kind"], "build_step_failed");
        assert!(!failed.is_success());

        let done = JobOutcome::Completed { context: json!({}) };
        assert_eq!(serde_json::to_value(&done).unwrap()["status"], "completed");
        assert!(done.is_success());
    }

    #[test]
    fn test_failed_outcome_without_context_field() {
        let outcome: JobOutcome =
            serde_json::from_str(r#"{"status":"failed","kind":"internal","message":"boom"}"#).unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                kind: ErrorKind::Internal,
                message: "boom".to_string(),
                context: None,
            }
        );
    }
}
