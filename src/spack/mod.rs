//! Package manager integration.
//!
//! [`SpackEnvironment`] builds the package-manager command lines used by the
//! pipeline stages for one run workspace. [`ManifestPatcher`] keeps the
//! workspace manifest in line with configuration.

pub mod manifest;

use std::path::PathBuf;

use crate::config::Settings;
use crate::execution::ShellCommand;

pub use manifest::ManifestPatcher;

/// A package-manager environment rooted at a run workspace.
#[derive(Debug, Clone)]
pub struct SpackEnvironment {
    command: String,
    path: PathBuf,
    mirror: String,
}

impl SpackEnvironment {
    /// Creates command builders for the environment at `path`.
    pub fn new(settings: &Settings, path: impl Into<PathBuf>) -> Self {
        Self {
            command: settings.spack.command.clone(),
            path: path.into(),
            mirror: settings.spack.buildcache.mirror.clone(),
        }
    }

    /// `<spack> --env <path> <subcommand> ...`, run inside the workspace.
    fn env_command(&self, subcommand: &str) -> ShellCommand {
        ShellCommand::new(&self.command)
            .arg("--env")
            .arg(self.path.display().to_string())
            .arg(subcommand)
            .with_cwd(&self.path)
    }

    /// Creates the environment (and its manifest) in the workspace.
    pub fn create(&self) -> ShellCommand {
        ShellCommand::new(&self.command)
            .args(["env", "create", "--without-view", "--dir"])
            .arg(self.path.display().to_string())
            .with_cwd(&self.path)
    }

    /// Adds `packages` to the environment manifest.
    pub fn add<S: AsRef<str>>(&self, packages: &[S]) -> ShellCommand {
        self.env_command("add")
            .args(packages.iter().map(|p| p.as_ref().to_string()))
    }

    /// Emits a container build definition into `filename`.
    pub fn containerize(&self, filename: impl Into<PathBuf>) -> ShellCommand {
        self.env_command("containerize").with_stdout_file(filename)
    }

    /// Concretizes the environment against the patched manifest.
    pub fn concretize(&self) -> ShellCommand {
        self.env_command("concretize")
    }

    /// Pushes the compiled `package` to the build cache mirror.
    pub fn buildcache(&self, package: &str) -> ShellCommand {
        self.env_command("buildcache")
            .args(["push", "--allow-root", "--force"])
            .arg(&self.mirror)
            .arg(package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn env() -> SpackEnvironment {
        let settings = Settings::from_yaml_layers(None).unwrap();
        SpackEnvironment::new(&settings, "/ws/run")
    }

    #[test]
    fn test_create_command() {
        let cmd = env().create();
        assert_eq!(
            cmd.display(),
            "spack env create --without-view --dir /ws/run"
        );
        assert_eq!(cmd.working_dir(), Some(Path::new("/ws/run")));
    }

    #[test]
    fn test_add_command_keeps_package_order() {
        let cmd = env().add(&["zlib", "py-numpy@1.26"]);
        assert_eq!(cmd.display(), "spack --env /ws/run add zlib py-numpy@1.26");
    }

    #[test]
    fn test_buildcache_uses_configured_mirror() {
        let cmd = env().buildcache("zlib");
        assert_eq!(
            cmd.display(),
            "spack --env /ws/run buildcache push --allow-root --force local zlib"
        );
    }

    #[test]
    fn test_concretize_command() {
        assert_eq!(env().concretize().display(), "spack --env /ws/run concretize");
    }
}
