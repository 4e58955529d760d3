//! Two-stage container builds.
//!
//! A run produces two build definitions from the package manager: a build
//! stage that compiles packages in a sandbox and pushes them to the build
//! cache, and a final stage that copies the result onto a slim base image.
//!
//! # Architecture
//!
//! The builder is a linear state machine; each arrow is one operation:
//! ```text
//! NOT_STARTED → BUILD_STAGE_PATCHED → BUILD_STAGE_CONTAINERIZED → BUILD_STAGE_IMAGED
//!   → FINAL_STAGE_PATCHED → FINAL_STAGE_CONTAINERIZED → FINAL_STAGE_IMAGED → DONE
//! ```
//! A failing operation leaves the builder in the state it had reached. The
//! state travels with the run context, so each stage may run in a different
//! worker process.

pub mod singularity;

pub use singularity::Singularity;

use std::path::{Path, PathBuf};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::config::Settings;
use crate::error::PipelineError;
use crate::logging::LogSink;
use crate::registry::Registry;
use crate::spack::{ManifestPatcher, SpackEnvironment};
use crate::storage::ArtifactStore;
use crate::utils::patterns;

/// Half of the two-stage container build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Build,
    Final,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Build => "build",
            StageKind::Final => "final",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress of the container build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuilderState {
    #[default]
    NotStarted,
    BuildStagePatched,
    BuildStageContainerized,
    BuildStageImaged,
    FinalStagePatched,
    FinalStageContainerized,
    FinalStageImaged,
    Done,
}

impl std::fmt::Display for BuilderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BuilderState::NotStarted => "NOT_STARTED",
            BuilderState::BuildStagePatched => "BUILD_STAGE_PATCHED",
            BuilderState::BuildStageContainerized => "BUILD_STAGE_CONTAINERIZED",
            BuilderState::BuildStageImaged => "BUILD_STAGE_IMAGED",
            BuilderState::FinalStagePatched => "FINAL_STAGE_PATCHED",
            BuilderState::FinalStageContainerized => "FINAL_STAGE_CONTAINERIZED",
            BuilderState::FinalStageImaged => "FINAL_STAGE_IMAGED",
            BuilderState::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

/// Drives the container build for one run workspace.
pub struct ContainerStageBuilder<'a> {
    settings: &'a Settings,
    name: String,
    workspace: PathBuf,
    packages: Vec<String>,
    state: BuilderState,
    spack: SpackEnvironment,
    manifest: ManifestPatcher,
    singularity: Singularity,
}

impl<'a> ContainerStageBuilder<'a> {
    /// Rebuilds the builder for a run, resuming from `state`.
    pub fn new(
        settings: &'a Settings,
        name: impl Into<String>,
        workspace: impl Into<PathBuf>,
        packages: Vec<String>,
        state: BuilderState,
    ) -> Self {
        let workspace = workspace.into();
        Self {
            settings,
            name: name.into(),
            spack: SpackEnvironment::new(settings, &workspace),
            manifest: ManifestPatcher::new(settings, &workspace),
            singularity: Singularity::new(settings, &workspace),
            workspace,
            packages,
            state,
        }
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    /// Build definition file for `kind`.
    pub fn definition_path(&self, kind: StageKind) -> PathBuf {
        self.workspace.join(
            self.settings
                .container
                .singularity
                .spec
                .replace("{stage}", kind.as_str()),
        )
    }

    /// Final image file.
    pub fn image_path(&self) -> PathBuf {
        self.workspace.join(&self.settings.container.singularity.image)
    }

    fn expect_state(&self, expected: BuilderState) -> Result<(), PipelineError> {
        if self.state != expected {
            return Err(PipelineError::StageOrder {
                expected: expected.to_string(),
                found: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Selects the stage's manifest container template.
    fn patch_manifest(&self, kind: StageKind) -> Result<(), PipelineError> {
        let template = self.settings.container.template.replace("{stage}", kind.as_str());
        let mut container = Mapping::new();
        container.insert(Value::from("template"), Value::from(template));
        let mut overlay = Mapping::new();
        overlay.insert(Value::from("container"), Value::Mapping(container));
        self.manifest.patch(&Value::Mapping(overlay))?;
        Ok(())
    }

    /// Runs the build stage: patch, containerize, append cache pushes, build the sandbox.
    ///
    /// # Errors
    ///
    /// Returns `StageOrder` unless the builder has not started, or the error of
    /// the first failing step.
    pub async fn build_stage(
        &mut self,
        stage: &str,
        sink: &LogSink,
        artifacts: &ArtifactStore,
    ) -> Result<(), PipelineError> {
        self.expect_state(BuilderState::NotStarted)?;
        let definition = self.definition_path(StageKind::Build);

        self.patch_manifest(StageKind::Build)?;
        self.state = BuilderState::BuildStagePatched;

        self.spack
            .containerize(&definition)
            .with_stage(stage)
            .run(sink)
            .await?;
        self.append_buildcache_commands(&definition).await?;
        artifacts.add(&definition, &self.name).await?;
        self.state = BuilderState::BuildStageContainerized;

        let bind = self.settings.container.singularity.build.bind.clone();
        self.singularity
            .build([
                "--bind".to_string(),
                bind,
                "--sandbox".to_string(),
                "build/".to_string(),
                definition.display().to_string(),
            ])
            .with_stage(stage)
            .run(sink)
            .await?;
        self.state = BuilderState::BuildStageImaged;
        sink.info(&format!("build stage imaged: {}", definition.display()));
        Ok(())
    }

    /// Runs the final stage: patch, containerize, swap the base image, build the image.
    ///
    /// # Errors
    ///
    /// Returns `StageOrder` unless the build stage is imaged, or the error of
    /// the first failing step.
    pub async fn final_stage(
        &mut self,
        stage: &str,
        sink: &LogSink,
        artifacts: &ArtifactStore,
    ) -> Result<(), PipelineError> {
        self.expect_state(BuilderState::BuildStageImaged)?;
        let definition = self.definition_path(StageKind::Final);

        self.patch_manifest(StageKind::Final)?;
        self.state = BuilderState::FinalStagePatched;

        self.spack
            .containerize(&definition)
            .with_stage(stage)
            .run(sink)
            .await?;
        let os = self.manifest.container_os()?;
        let image = self.final_image_override();
        match (os, image) {
            (Some(os), Some(image)) => {
                sink.info(&format!("replacing base image {} with {}", os, image));
                let content = tokio::fs::read_to_string(&definition).await?;
                let patched = patch_final_definition(&content, &os, Some(image))?;
                tokio::fs::write(&definition, patched).await?;
            }
            (None, Some(_)) => {
                sink.warn("manifest has no container base image; final definition left unchanged");
            }
            _ => {}
        }
        artifacts.add(&definition, &self.name).await?;
        self.state = BuilderState::FinalStageContainerized;

        self.singularity
            .build([
                self.image_path().display().to_string(),
                definition.display().to_string(),
            ])
            .with_stage(stage)
            .run(sink)
            .await?;
        self.state = BuilderState::FinalStageImaged;

        sink.info(&format!("final image built: {}", self.image_path().display()));
        self.state = BuilderState::Done;
        Ok(())
    }

    /// Pushes the final image to `registry` as `version`.
    ///
    /// Login, push and logout run as a unit: once login succeeds, logout runs
    /// whether or not the push does.
    pub async fn push_image(
        &self,
        stage: &str,
        registry: &Registry,
        version: &str,
        sink: &LogSink,
    ) -> Result<(), PipelineError> {
        self.expect_state(BuilderState::Done)?;
        let url = registry.image_ref(version);
        sink.info(&format!("pushing image to {} ({})", url, registry.key));

        self.singularity
            .remote_login(registry)
            .with_stage(stage)
            .run(sink)
            .await?;

        let pushed = self
            .singularity
            .push(&self.image_path(), &url)
            .with_stage(stage)
            .run(sink)
            .await;
        let logged_out = self
            .singularity
            .remote_logout()
            .with_stage(stage)
            .run(sink)
            .await;

        pushed?;
        logged_out?;
        Ok(())
    }

    /// Image override of the first patch rule matching a requested package.
    fn final_image_override(&self) -> Option<&str> {
        patterns::first_match(&self.settings.container.singularity.patch, &self.packages, |r| {
            r.pattern.as_str()
        })
        .and_then(|rule| rule.final_stage.as_ref())
        .map(|s| s.image.as_str())
    }

    /// Appends a build cache push for every package to the build definition.
    async fn append_buildcache_commands(&self, definition: &Path) -> Result<(), PipelineError> {
        let mut content = tokio::fs::read_to_string(definition).await?;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str("  # spack build cache\n");
        for package in &self.packages {
            content.push_str(&format!("  {}\n", self.spack.buildcache(package).display()));
        }
        tokio::fs::write(definition, content).await?;
        Ok(())
    }
}

/// Replaces the base OS image on lines ending in `os` with `image`.
///
/// Lines have the form `<prefix><whitespace><os>`; the prefix is kept. With no
/// image the content is returned unchanged.
pub fn patch_final_definition(
    content: &str,
    os: &str,
    image: Option<&str>,
) -> Result<String, PipelineError> {
    let image = match image {
        Some(image) => image,
        None => return Ok(content.to_string()),
    };
    let marker = Regex::new(&format!(r"^(.*?)\s({})$", regex::escape(os)))
        .map_err(|e| PipelineError::ManifestPatch {
            path: "spack.container.images.os".to_string(),
            reason: e.to_string(),
        })?;

    let mut patched = String::with_capacity(content.len());
    for line in content.split_inclusive('\n') {
        let (body, ending) = match line.strip_suffix("\r\n") {
            Some(body) => (body, "\r\n"),
            None => match line.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (line, ""),
            },
        };
        let replaced = marker.replace(body, |caps: &Captures| format!("{} {}", &caps[1], image));
        patched.push_str(&replaced);
        patched.push_str(ending);
    }
    Ok(patched)
}
