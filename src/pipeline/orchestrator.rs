//! Pipeline coordinator for environment builds.
//!
//! This module provides the `PipelineCoordinator` that:
//! - Validates a build request and allocates its run id and workspace
//! - Submits the stages of a run to the stage queue, strictly in order
//! - Threads the context returned by each stage into the next one
//! - Tracks run descriptors for status queries
//!
//! A run is the only state machine at this level:
//! `SCHEDULED → RUNNING → {COMPLETED | FAILED}`. The first failing stage
//! fails the run; nothing is retried or rolled back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{ErrorKind, PipelineError};
use crate::logging::{ContextLogger, ExecutionScope, LogSink};
use crate::scheduler::{JobOutcome, StageJob, StageQueue};

use super::context::{EnvironmentContext, EnvironmentModel};
use super::stages::Stage;

/// State of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Scheduled => write!(f, "SCHEDULED"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Completed => write!(f, "COMPLETED"),
            RunState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Stage that failed, if the failure happened inside one.
    pub stage: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Everything the coordinator knows about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDescriptor {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: RunState,
    pub failure: Option<RunFailure>,
    pub completed_stages: Vec<String>,
    /// Published image version, once known.
    pub image_version: Option<String>,
}

impl RunDescriptor {
    fn scheduled(ctx: &EnvironmentContext) -> Self {
        Self {
            id: ctx.id,
            name: ctx.name.clone(),
            created_at: ctx.created_at,
            updated_at: ctx.created_at,
            state: RunState::Scheduled,
            failure: None,
            completed_stages: Vec::new(),
            image_version: None,
        }
    }

    /// The public status view: `{id, name, created, state: {type}}`.
    pub fn status(&self) -> RunStatus {
        RunStatus {
            id: self.id,
            name: self.name.clone(),
            created: self.created_at,
            state: self.state,
        }
    }
}

/// Status of a run as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub id: Uuid,
    pub name: String,
    pub created: DateTime<Utc>,
    pub state: RunState,
}

/// Coordinates environment build runs.
#[derive(Clone)]
pub struct PipelineCoordinator {
    settings: Arc<Settings>,
    queue: Arc<dyn StageQueue>,
    logger: Arc<ContextLogger>,
    runs: Arc<RwLock<HashMap<Uuid, RunDescriptor>>>,
}

impl PipelineCoordinator {
    /// Creates a coordinator submitting stages to `queue`.
    pub fn new(settings: Arc<Settings>, queue: Arc<dyn StageQueue>, logger: Arc<ContextLogger>) -> Self {
        Self {
            settings,
            queue,
            logger,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Schedules a run and drives it in the background.
    ///
    /// Returns the `SCHEDULED` descriptor immediately; poll [`status`] for
    /// progress.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` or `InvalidModel` before anything is created,
    /// or an IO error if the workspace cannot be created.
    ///
    /// [`status`]: PipelineCoordinator::status
    pub async fn submit(
        &self,
        name: &str,
        model: EnvironmentModel,
    ) -> Result<RunDescriptor, PipelineError> {
        let ctx = self.prepare(name, model).await?;
        let descriptor = RunDescriptor::scheduled(&ctx);
        let this = self.clone();
        tokio::spawn(async move { this.execute(ctx).await });
        Ok(descriptor)
    }

    /// Runs a build to completion and returns its final descriptor.
    ///
    /// A failing stage is reported through the descriptor, not as an error.
    pub async fn run(
        &self,
        name: &str,
        model: EnvironmentModel,
    ) -> Result<RunDescriptor, PipelineError> {
        let ctx = self.prepare(name, model).await?;
        Ok(self.execute(ctx).await)
    }

    /// Returns the descriptor of run `id`.
    pub async fn status(&self, id: Uuid) -> Result<RunDescriptor, PipelineError> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(PipelineError::RunNotFound(id))
    }

    /// Returns all known runs, oldest first.
    pub async fn runs(&self) -> Vec<RunDescriptor> {
        let mut runs: Vec<_> = self.runs.read().await.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// Polls run `id` until it completes or fails.
    pub async fn wait(&self, id: Uuid, poll_interval: Duration) -> Result<RunDescriptor, PipelineError> {
        loop {
            let descriptor = self.status(id).await?;
            if descriptor.state.is_terminal() {
                return Ok(descriptor);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Validates the request, creates the workspace and registers the run.
    async fn prepare(
        &self,
        name: &str,
        model: EnvironmentModel,
    ) -> Result<EnvironmentContext, PipelineError> {
        self.settings.validate()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(PipelineError::InvalidModel(
                "environment name must not be empty".to_string(),
            ));
        }
        if name.split('/').any(|part| part == "..") {
            return Err(PipelineError::InvalidModel(format!(
                "environment name must not contain '..': {}",
                name
            )));
        }
        model.validate()?;

        let root = &self.settings.environments.path;
        tokio::fs::create_dir_all(root).await?;
        let ctx = EnvironmentContext::new(Uuid::new_v4(), name, root, model);
        // Fails if the directory exists: a workspace belongs to exactly one run.
        tokio::fs::create_dir(&ctx.workspace).await?;

        self.runs
            .write()
            .await
            .insert(ctx.id, RunDescriptor::scheduled(&ctx));
        info!(run_id = %ctx.id, name = %ctx.name, workspace = %ctx.workspace.display(), "Run scheduled");
        Ok(ctx)
    }

    /// Drives every stage of a prepared run and records the outcome.
    async fn execute(&self, ctx: EnvironmentContext) -> RunDescriptor {
        let id = ctx.id;
        let scheduled = RunDescriptor::scheduled(&ctx);
        let result = match self.logger.resolve(Some(&ExecutionScope::coordinator(id))) {
            Ok(sink) => {
                self.set_state(id, RunState::Running).await;
                sink.info(&format!(
                    "building environment {} with packages {}",
                    ctx.name,
                    ctx.model.packages.join(", ")
                ));
                let result = self.drive(ctx, &sink).await;
                match &result {
                    Ok(_) => sink.info("run completed"),
                    Err(failure) => sink.error(&format!("run failed: {}", failure.message)),
                }
                result
            }
            Err(e) => Err(RunFailure {
                stage: None,
                kind: e.kind(),
                message: e.to_string(),
            }),
        };
        self.logger.release(id);

        let mut runs = self.runs.write().await;
        let descriptor = runs.entry(id).or_insert(scheduled);
        descriptor.updated_at = Utc::now();
        match result {
            Ok(()) => {
                descriptor.state = RunState::Completed;
                info!(run_id = %id, "Run completed");
            }
            Err(failure) => {
                error!(run_id = %id, stage = ?failure.stage, error = %failure.message, "Run failed");
                descriptor.state = RunState::Failed;
                descriptor.failure = Some(failure);
            }
        }
        descriptor.clone()
    }

    /// Submits the stages one after another, feeding each the previous result.
    async fn drive(&self, mut ctx: EnvironmentContext, sink: &LogSink) -> Result<(), RunFailure> {
        for stage in Stage::ALL {
            let fail = |e: PipelineError| RunFailure {
                stage: Some(stage.as_str().to_string()),
                kind: e.kind(),
                message: e.to_string(),
            };

            let job = StageJob::new(ctx.id, stage.as_str(), ctx.to_payload().map_err(fail)?);
            let job_id = job.id;
            self.queue
                .enqueue(job)
                .await
                .map_err(|e| fail(e.into()))?;
            sink.info(&format!("submitted stage {} as job {}", stage, job_id));

            let result = self
                .queue
                .wait_result(job_id, None)
                .await
                .map_err(|e| fail(e.into()))?;

            match result.outcome {
                JobOutcome::Completed { context } => {
                    ctx = self.accept(&ctx, &context).map_err(fail)?;
                    sink.info(&format!(
                        "stage {} completed on {} in {}ms",
                        stage, result.worker_id, result.duration_ms
                    ));
                    self.record_progress(&ctx).await;
                }
                JobOutcome::Failed {
                    kind,
                    message,
                    context,
                } => {
                    if let Some(partial) = context.and_then(|c| self.accept(&ctx, &c).ok()) {
                        sink.warn(&format!("builder halted in state {}", partial.builder_state));
                    }
                    return Err(fail(PipelineError::StageFailed {
                        stage: stage.as_str().to_string(),
                        kind,
                        message,
                    }));
                }
            }
        }
        Ok(())
    }

    /// Decodes a returned context, checking it belongs to the same run.
    fn accept(
        &self,
        current: &EnvironmentContext,
        payload: &serde_json::Value,
    ) -> Result<EnvironmentContext, PipelineError> {
        let next = EnvironmentContext::from_payload(payload)?;
        if next.id != current.id || next.workspace != current.workspace {
            return Err(PipelineError::StageOrder {
                expected: format!("context of run {}", current.id),
                found: format!("context of run {}", next.id),
            });
        }
        Ok(next)
    }

    async fn set_state(&self, id: Uuid, state: RunState) {
        if let Some(descriptor) = self.runs.write().await.get_mut(&id) {
            descriptor.state = state;
            descriptor.updated_at = Utc::now();
        }
    }

    async fn record_progress(&self, ctx: &EnvironmentContext) {
        if let Some(descriptor) = self.runs.write().await.get_mut(&ctx.id) {
            descriptor.completed_stages = ctx.completed_stages.clone();
            descriptor.image_version = ctx.image_version.clone();
            descriptor.updated_at = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{MemoryQueue, StageExecutor, WorkerPool, WorkerPoolConfig};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Completes stages without side effects, failing at `fail_at`.
    struct ScriptedExecutor {
        fail_at: Option<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StageExecutor for ScriptedExecutor {
        async fn execute(&self, job: &StageJob) -> JobOutcome {
            self.seen.lock().unwrap().push(job.stage.clone());
            let mut ctx = EnvironmentContext::from_payload(&job.context).unwrap();
            if Some(job.stage.as_str()) == self.fail_at {
                return JobOutcome::Failed {
                    kind: ErrorKind::BuildStepFailed,
                    message: "singularity: not found".to_string(),
                    context: Some(ctx.to_payload().unwrap()),
                };
            }
            if job.stage == "publish" {
                ctx.set_image_version("1.0");
            }
            ctx.complete_stage(&job.stage);
            JobOutcome::Completed {
                context: ctx.to_payload().unwrap(),
            }
        }
    }

    async fn setup(
        dir: &Path,
        fail_at: Option<&'static str>,
    ) -> (PipelineCoordinator, WorkerPool, Arc<ScriptedExecutor>) {
        let mut settings = Settings::from_yaml_layers(None).unwrap();
        settings.environments.path = dir.to_path_buf();
        let settings = Arc::new(settings);

        let queue = Arc::new(MemoryQueue::new());
        let executor = Arc::new(ScriptedExecutor {
            fail_at,
            seen: Mutex::new(Vec::new()),
        });
        let mut pool = WorkerPool::new(
            WorkerPoolConfig::new(2).with_poll_interval(Duration::from_millis(20)),
            queue.clone(),
            executor.clone(),
        );
        pool.start().unwrap();

        let logger = Arc::new(ContextLogger::new(Arc::clone(&settings)));
        (PipelineCoordinator::new(settings, queue, logger), pool, executor)
    }

    #[tokio::test]
    async fn test_run_completes_all_stages_in_order() {
        let dir = TempDir::new().unwrap();
        let (coordinator, mut pool, executor) = setup(dir.path(), None).await;

        let descriptor = coordinator
            .run("demo", EnvironmentModel::new("d", ["zlib"]))
            .await
            .unwrap();

        assert_eq!(descriptor.state, RunState::Completed);
        assert_eq!(descriptor.image_version.as_deref(), Some("1.0"));
        let expected: Vec<String> = Stage::ALL.iter().map(|s| s.as_str().to_string()).collect();
        assert_eq!(descriptor.completed_stages, expected);
        assert_eq!(*executor.seen.lock().unwrap(), expected);

        let log = dir.path().join(descriptor.id.to_string()).join("build.log");
        assert!(std::fs::metadata(log).unwrap().len() > 0);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_stage_stops_the_run() {
        let dir = TempDir::new().unwrap();
        let (coordinator, mut pool, executor) = setup(dir.path(), Some("containerize-build")).await;

        let descriptor = coordinator
            .run("demo", EnvironmentModel::new("d", ["zlib"]))
            .await
            .unwrap();

        assert_eq!(descriptor.state, RunState::Failed);
        let failure = descriptor.failure.unwrap();
        assert_eq!(failure.stage.as_deref(), Some("containerize-build"));
        assert_eq!(failure.kind, ErrorKind::BuildStepFailed);
        assert!(failure.message.contains("singularity: not found"));
        assert_eq!(descriptor.completed_stages, ["stage", "create-manifest"]);
        assert!(!executor.seen.lock().unwrap().contains(&"publish".to_string()));
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_returns_scheduled_and_status_tracks_run() {
        let dir = TempDir::new().unwrap();
        let (coordinator, mut pool, _) = setup(dir.path(), None).await;

        let descriptor = coordinator
            .submit("demo", EnvironmentModel::new("d", ["zlib"]))
            .await
            .unwrap();
        assert_eq!(descriptor.state, RunState::Scheduled);

        let status = serde_json::to_value(descriptor.status()).unwrap();
        assert_eq!(status["state"]["type"], "SCHEDULED");
        assert_eq!(status["name"], "demo");

        let done = coordinator
            .wait(descriptor.id, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(done.state, RunState::Completed);
        assert_eq!(coordinator.runs().await.len(), 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_requests_create_nothing() {
        let dir = TempDir::new().unwrap();
        let (coordinator, mut pool, _) = setup(dir.path(), None).await;

        let empty = EnvironmentModel {
            description: "d".to_string(),
            packages: Vec::new(),
        };
        assert!(matches!(
            coordinator.submit("demo", empty).await,
            Err(PipelineError::InvalidModel(_))
        ));
        assert!(matches!(
            coordinator.submit("  ", EnvironmentModel::new("d", ["zlib"])).await,
            Err(PipelineError::InvalidModel(_))
        ));
        assert!(matches!(
            coordinator
                .submit("users/../../etc", EnvironmentModel::new("d", ["zlib"]))
                .await,
            Err(PipelineError::InvalidModel(_))
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(matches!(
            coordinator.status(Uuid::new_v4()).await,
            Err(PipelineError::RunNotFound(_))
        ));
        pool.shutdown().await.unwrap();
    }
}
