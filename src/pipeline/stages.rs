//! Pipeline stages and their worker-side execution.
//!
//! Each stage takes the run context, performs its side effects in the run
//! workspace and returns the updated context. [`StageRunner`] is the
//! [`StageExecutor`] plugged into the worker pool: it decodes the context
//! payload, rebuilds the helpers it needs from settings and runs one stage.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::Settings;
use crate::container::ContainerStageBuilder;
use crate::error::PipelineError;
use crate::logging::{ContextLogger, ExecutionScope, LogSink};
use crate::modulefile::{BuildInfo, ModuleFileRenderer};
use crate::registry::{Registry, RegistryVersionResolver};
use crate::scheduler::{JobOutcome, StageExecutor, StageJob};
use crate::spack::{ManifestPatcher, SpackEnvironment};
use crate::storage::ArtifactStore;

use super::context::EnvironmentContext;

/// One step of the build pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Creates the package manager environment in the workspace.
    Stage,
    /// Adds the requested packages and patches the manifest.
    CreateManifest,
    ContainerizeBuild,
    ContainerizeFinal,
    /// Negotiates the image version and pushes to every registry.
    Publish,
    RenderModuleFile,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 6] = [
        Stage::Stage,
        Stage::CreateManifest,
        Stage::ContainerizeBuild,
        Stage::ContainerizeFinal,
        Stage::Publish,
        Stage::RenderModuleFile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Stage => "stage",
            Stage::CreateManifest => "create-manifest",
            Stage::ContainerizeBuild => "containerize-build",
            Stage::ContainerizeFinal => "containerize-final",
            Stage::Publish => "publish",
            Stage::RenderModuleFile => "render-modulefile",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| PipelineError::StageOrder {
                expected: "a known stage".to_string(),
                found: s.to_string(),
            })
    }
}

/// Runs stages on a worker.
pub struct StageRunner {
    settings: Arc<Settings>,
    logger: Arc<ContextLogger>,
    artifacts: Arc<ArtifactStore>,
    resolver: RegistryVersionResolver,
}

impl StageRunner {
    pub fn new(
        settings: Arc<Settings>,
        logger: Arc<ContextLogger>,
        artifacts: Arc<ArtifactStore>,
        resolver: RegistryVersionResolver,
    ) -> Self {
        Self {
            settings,
            logger,
            artifacts,
            resolver,
        }
    }

    /// Runs `stage` against `ctx`, updating it in place.
    ///
    /// Builder progress is written back to the context even when the stage
    /// fails, so the failure state can be reported.
    pub async fn run_stage(
        &self,
        stage: Stage,
        ctx: &mut EnvironmentContext,
        sink: &LogSink,
    ) -> Result<(), PipelineError> {
        sink.info(&format!("stage {} started", stage));
        let name = stage.as_str();

        match stage {
            Stage::Stage => {
                tokio::fs::create_dir_all(&ctx.workspace).await?;
                SpackEnvironment::new(&self.settings, &ctx.workspace)
                    .create()
                    .with_stage(name)
                    .run(sink)
                    .await?;
            }
            Stage::CreateManifest => {
                let spack = SpackEnvironment::new(&self.settings, &ctx.workspace);
                spack
                    .add(&ctx.model.packages)
                    .with_stage(name)
                    .run(sink)
                    .await?;
                let manifest = ManifestPatcher::new(&self.settings, &ctx.workspace);
                manifest.patch(&serde_yaml::Value::Null)?;
                if self.settings.spack.concretize {
                    spack.concretize().with_stage(name).run(sink).await?;
                }
                self.artifacts.add(manifest.path(), &ctx.name).await?;
            }
            Stage::ContainerizeBuild => {
                let mut builder = self.builder(ctx);
                let result = builder.build_stage(name, sink, &self.artifacts).await;
                ctx.builder_state = builder.state();
                result?;
            }
            Stage::ContainerizeFinal => {
                let mut builder = self.builder(ctx);
                let result = builder.final_stage(name, sink, &self.artifacts).await;
                ctx.builder_state = builder.state();
                result?;
            }
            Stage::Publish => {
                let default = Registry::default_for(&self.settings, &ctx.name)?;
                let version = match ctx.image_version.clone() {
                    Some(version) => version,
                    None => self.resolver.next_version(&default, sink).await,
                };
                let version = ctx.set_image_version(version).to_string();
                sink.info(&format!("publishing {} as version {}", default.image_url(), version));

                let builder = self.builder(ctx);
                for registry in Registry::all(&self.settings, &ctx.name) {
                    builder.push_image(name, &registry, &version, sink).await?;
                }
            }
            Stage::RenderModuleFile => {
                let version = ctx.image_version.clone().ok_or_else(|| PipelineError::StageOrder {
                    expected: "published image version".to_string(),
                    found: "unpublished".to_string(),
                })?;
                let default = Registry::default_for(&self.settings, &ctx.name)?;
                let build = BuildInfo {
                    id: ctx.id,
                    image: default.image_ref(&version),
                    created: ctx.created_at,
                    updated: Utc::now(),
                };
                let path = ModuleFileRenderer::new(&self.settings).write(
                    &ctx.workspace,
                    &ctx.model.description,
                    &ctx.model.packages,
                    &build,
                )?;
                self.artifacts.add(&path, &ctx.name).await?;
            }
        }

        sink.info(&format!("stage {} finished", stage));
        Ok(())
    }

    fn builder<'a>(&'a self, ctx: &EnvironmentContext) -> ContainerStageBuilder<'a> {
        ContainerStageBuilder::new(
            &self.settings,
            ctx.name.clone(),
            ctx.workspace.clone(),
            ctx.model.packages.clone(),
            ctx.builder_state,
        )
    }
}

fn failed(err: &PipelineError, context: Option<serde_json::Value>) -> JobOutcome {
    JobOutcome::Failed {
        kind: err.kind(),
        message: err.to_string(),
        context,
    }
}

#[async_trait]
impl StageExecutor for StageRunner {
    async fn execute(&self, job: &StageJob) -> JobOutcome {
        let mut ctx = match EnvironmentContext::from_payload(&job.context) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Rejected stage payload");
                return failed(&e, None);
            }
        };
        let stage = match job.stage.parse::<Stage>() {
            Ok(stage) => stage,
            Err(e) => return failed(&e, None),
        };
        let sink = match self.logger.resolve(Some(&ExecutionScope::worker(ctx.id))) {
            Ok(sink) => sink,
            Err(e) => return failed(&e, None),
        };

        let result = self.run_stage(stage, &mut ctx, &sink).await;
        let outcome = match result {
            Ok(()) => {
                ctx.complete_stage(stage.as_str());
                match ctx.to_payload() {
                    Ok(context) => JobOutcome::Completed { context },
                    Err(e) => failed(&e, None),
                }
            }
            Err(e) => {
                sink.error(&format!("stage {} failed: {}", stage, e));
                ctx.touch();
                failed(&e, ctx.to_payload().ok())
            }
        };

        if !outcome.is_success() || stage == Stage::RenderModuleFile {
            self.logger.release(ctx.id);
        }
        outcome
    }
}
