//! Singularity command lines.

use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::execution::ShellCommand;
use crate::registry::Registry;

/// Environment variable carrying the registry username to the login script.
pub const USERNAME_VAR: &str = "REGISTRY_USERNAME";
/// Environment variable carrying the registry secret to the login script.
pub const PASSWORD_VAR: &str = "REGISTRY_PASSWORD";

/// Builds container-builder commands that run inside a workspace.
#[derive(Debug, Clone)]
pub struct Singularity {
    command: String,
    workspace: PathBuf,
}

impl Singularity {
    pub fn new(settings: &Settings, workspace: impl Into<PathBuf>) -> Self {
        Self {
            command: settings.container.command.clone(),
            workspace: workspace.into(),
        }
    }

    fn command(&self, subcommand: &str) -> ShellCommand {
        ShellCommand::new(&self.command)
            .arg(subcommand)
            .with_cwd(&self.workspace)
    }

    /// `build --force --fakeroot <args>`.
    pub fn build<I, S>(&self, args: I) -> ShellCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command("build").args(["--force", "--fakeroot"]).args(args)
    }

    /// Pushes `image` to `url`.
    pub fn push(&self, image: &Path, url: &str) -> ShellCommand {
        self.command("push")
            .arg(image.display().to_string())
            .arg(url)
    }

    /// Logs in to `registry`.
    ///
    /// The credentials travel as environment variables and the secret is piped
    /// to `--password-stdin`, so neither appears in the process arguments.
    pub fn remote_login(&self, registry: &Registry) -> ShellCommand {
        let script = format!(
            "printf '%s' \"${pw}\" | \"$0\" remote login --username \"${user}\" --password-stdin \"$1\"",
            pw = PASSWORD_VAR,
            user = USERNAME_VAR,
        );
        ShellCommand::shell(script)
            .arg(&self.command)
            .arg(&registry.url)
            .with_cwd(&self.workspace)
            .with_env(USERNAME_VAR, &registry.username)
            .with_env(PASSWORD_VAR, &registry.password)
    }

    pub fn remote_logout(&self) -> ShellCommand {
        self.command("remote").arg("logout")
    }
}
