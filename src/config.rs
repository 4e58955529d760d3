//! Settings for the build pipeline.
//!
//! Settings are assembled once at process start and shared by `Arc` with every
//! component:
//!
//! 1. Built-in defaults (`conf/config.yml`, embedded at compile time)
//! 2. A user file (`~/.softpack/builder/config.yml`) or an explicit `--config` file,
//!    deep-merged over the defaults
//! 3. Environment variable overrides
//!
//! # Environment Variables
//!
//! - `ENVFORGE_ENVIRONMENTS_PATH`: Root directory for run workspaces
//! - `ENVFORGE_ARTIFACTS_PATH`: Root directory of the artifact store
//! - `ENVFORGE_QUEUE_URL`: Redis URL of the stage queue (unset: in-process queue)
//! - `ENVFORGE_WORKERS`: Number of stage workers
//! - `ENVFORGE_REGISTRY_<NAME>_USERNAME` / `ENVFORGE_REGISTRY_<NAME>_PASSWORD`:
//!   Credentials for the registry called `<name>`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

use crate::utils::{deep_merge, prefix_regex};

/// Built-in default settings.
const DEFAULT_CONFIG: &str = include_str!("../conf/config.yml");

/// Location of the user settings file, relative to the home directory.
const USER_CONFIG_PATH: &str = ".softpack/builder/config.yml";

/// Name of the registry used for version negotiation and module files.
pub const DEFAULT_REGISTRY: &str = "default";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("Missing setting: {0}")]
    MissingSetting(String),

    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// An explicitly requested settings file does not exist.
    #[error("Settings file not found: {0}")]
    FileNotFound(PathBuf),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings document could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Settings for run workspaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentsConfig {
    /// Root directory; each run gets `<path>/<run id>`.
    pub path: PathBuf,
}

/// Settings for the per-run log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// File name of the run log inside the workspace.
    pub filename: String,
}

/// A conditional manifest overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecRule {
    /// Pattern matched against the specs already in the manifest.
    pub pattern: String,
    /// Block merged into the manifest's `spack` section when the pattern matches.
    #[serde(default)]
    pub spack: Value,
}

/// Settings for the package manager manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Manifest file name inside the workspace.
    pub name: String,
    /// Base configuration block merged into every manifest.
    #[serde(default)]
    pub spack: Value,
    /// Conditional overlays, first match wins.
    #[serde(default)]
    pub specs: Vec<SpecRule>,
}

/// Settings for the binary build cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildcacheConfig {
    /// Mirror that compiled packages are pushed to.
    pub mirror: String,
}

/// Settings for the package manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpackConfig {
    /// Package manager executable.
    pub command: String,
    /// Concretize the environment once its manifest is patched.
    #[serde(default)]
    pub concretize: bool,
    pub manifest: ManifestConfig,
    pub buildcache: BuildcacheConfig,
}

/// A module file template selected by package pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRule {
    /// Template file name.
    pub name: String,
    /// Pattern matched against requested packages.
    pub pattern: String,
}

/// Settings for module file templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatesConfig {
    /// Directory holding the template files.
    pub path: PathBuf,
    /// Template used when no rule matches.
    pub default: String,
    #[serde(default)]
    pub patterns: Vec<TemplateRule>,
}

/// Settings for module files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Module file name inside the workspace.
    pub name: String,
    pub templates: TemplatesConfig,
}

/// Image override applied to one container stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageImage {
    pub image: String,
}

/// An image override selected by package pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePatchRule {
    /// Pattern matched against requested packages.
    pub pattern: String,
    /// Override for the final stage's base image.
    #[serde(rename = "final", default)]
    pub final_stage: Option<StageImage>,
}

/// Settings for the sandbox build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Bind mount passed to the build stage.
    pub bind: String,
}

/// Settings for the Singularity container builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingularityConfig {
    /// Build definition file name; `{stage}` is replaced by the stage name.
    pub spec: String,
    /// Final image file name inside the workspace.
    pub image: String,
    pub build: SandboxConfig,
    #[serde(default)]
    pub patch: Vec<ImagePatchRule>,
}

/// Settings for containerization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container builder executable.
    pub command: String,
    /// Cache directory exposed to module files.
    pub cache: PathBuf,
    /// Manifest container template; `{stage}` is replaced by the stage name.
    pub template: String,
    pub singularity: SingularityConfig,
}

/// Credentials and location of one registry.
#[derive(Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Settings for the artifact store and registries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Root directory of the artifact store.
    pub path: PathBuf,
    pub registries: BTreeMap<String, RegistryConfig>,
}

/// Settings for the stage queue and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Redis URL; `None` runs stages on an in-process queue.
    #[serde(default)]
    pub url: Option<String>,
    pub name: String,
    pub workers: usize,
    pub poll_interval_ms: u64,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: None,
            name: "envforge:stages".to_string(),
            workers: 4,
            poll_interval_ms: 500,
        }
    }
}

/// Complete settings for one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub environments: EnvironmentsConfig,
    pub logging: LoggingConfig,
    pub spack: SpackConfig,
    pub modules: ModulesConfig,
    pub container: ContainerConfig,
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Settings {
    /// Loads settings from defaults, a settings file and the environment.
    ///
    /// With `path = None` the user file is used if present. An explicit path
    /// that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let overrides = match path {
            Some(path) => {
                if !path.is_file() {
                    return Err(ConfigError::FileNotFound(path.to_path_buf()));
                }
                Some(std::fs::read_to_string(path)?)
            }
            None => match dirs::home_dir().map(|home| home.join(USER_CONFIG_PATH)) {
                Some(user) if user.is_file() => Some(std::fs::read_to_string(user)?),
                _ => None,
            },
        };

        let mut settings = Self::from_yaml_layers(overrides.as_deref())?;
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Builds settings from the built-in defaults with `overrides` merged on top.
    ///
    /// No environment variables are consulted.
    pub fn from_yaml_layers(overrides: Option<&str>) -> Result<Self, ConfigError> {
        let mut document: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        if let Some(text) = overrides {
            let layer: Value = serde_yaml::from_str(text)?;
            deep_merge(&mut document, &layer);
        }
        Ok(serde_yaml::from_value(document)?)
    }

    /// Applies environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("ENVFORGE_ENVIRONMENTS_PATH") {
            self.environments.path = PathBuf::from(val);
        }

        if let Some(val) = lookup("ENVFORGE_ARTIFACTS_PATH") {
            self.artifacts.path = PathBuf::from(val);
        }

        if let Some(val) = lookup("ENVFORGE_QUEUE_URL") {
            self.queue.url = if val.trim().is_empty() { None } else { Some(val) };
        }

        if let Some(val) = lookup("ENVFORGE_WORKERS") {
            self.queue.workers = parse_env_value(&val, "ENVFORGE_WORKERS")?;
        }

        for (name, registry) in self.artifacts.registries.iter_mut() {
            let prefix = format!("ENVFORGE_REGISTRY_{}", env_key(name));
            if let Some(val) = lookup(&format!("{}_USERNAME", prefix)) {
                registry.username = val;
            }
            if let Some(val) = lookup(&format!("{}_PASSWORD", prefix)) {
                registry.password = val;
            }
        }

        Ok(())
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.artifacts.registries.contains_key(DEFAULT_REGISTRY) {
            return Err(ConfigError::MissingSetting(format!(
                "artifacts.registries.{}",
                DEFAULT_REGISTRY
            )));
        }

        for (key, value) in [
            ("spack.command", &self.spack.command),
            ("container.command", &self.container.command),
            ("spack.manifest.name", &self.spack.manifest.name),
            ("modules.name", &self.modules.name),
            ("logging.filename", &self.logging.filename),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingSetting(key.to_string()));
            }
        }

        if self.queue.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue.workers".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let patterns = self
            .spack
            .manifest
            .specs
            .iter()
            .map(|r| ("spack.manifest.specs", r.pattern.as_str()))
            .chain(
                self.modules
                    .templates
                    .patterns
                    .iter()
                    .map(|r| ("modules.templates.patterns", r.pattern.as_str())),
            )
            .chain(
                self.container
                    .singularity
                    .patch
                    .iter()
                    .map(|r| ("container.singularity.patch", r.pattern.as_str())),
            );
        for (key, pattern) in patterns {
            prefix_regex(pattern).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("invalid pattern '{}': {}", pattern, e),
            })?;
        }

        Ok(())
    }

    /// Returns the registry used for version negotiation.
    pub fn default_registry(&self) -> Result<&RegistryConfig, ConfigError> {
        self.artifacts
            .registries
            .get(DEFAULT_REGISTRY)
            .ok_or_else(|| {
                ConfigError::MissingSetting(format!("artifacts.registries.{}", DEFAULT_REGISTRY))
            })
    }

    /// Returns a copy with every registry secret replaced.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for registry in copy.artifacts.registries.values_mut() {
            if !registry.password.is_empty() {
                registry.password = "<redacted>".to_string();
            }
        }
        copy
    }
}

/// Converts a registry name into an environment variable fragment.
fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
