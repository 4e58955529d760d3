//! External command execution.
//!
//! Every build step (package manager, container builder, registry client) runs
//! through [`ShellCommand`]. Output is streamed line by line into the run's log
//! sink; a non-zero exit status or a spawn failure becomes a
//! [`PipelineError::BuildStepFailed`] naming the stage and the command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::error::PipelineError;
use crate::logging::LogSink;

/// Outcome of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Captured stdout, empty when stdout was redirected to a file.
    pub stdout: String,
    pub stderr: String,
}

/// A command line to run as part of a pipeline stage.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    stdout_file: Option<PathBuf>,
    stage: String,
}

impl ShellCommand {
    /// Creates a command for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            stdout_file: None,
            stage: String::new(),
        }
    }

    /// Creates a command that runs `script` with `sh -c`.
    ///
    /// Secrets must be passed through [`ShellCommand::with_env`] and referenced
    /// as variables in the script, never interpolated into it.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment variable override. Values are never logged.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Writes stdout to `path` instead of the log.
    pub fn with_stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    /// Names the stage reported in failures.
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// The command line as displayed in logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn failure(&self, reason: impl Into<String>) -> PipelineError {
        PipelineError::build_step(&self.stage, self.display(), reason)
    }

    /// Runs the command to completion, streaming output into `sink`.
    ///
    /// # Errors
    ///
    /// Returns `BuildStepFailed` if the program cannot be started or exits
    /// with a non-zero status.
    pub async fn run(&self, sink: &LogSink) -> Result<CommandOutput, PipelineError> {
        let start = Instant::now();
        sink.info(&format!("running shell command: {}", self.display()));

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| self.failure(format!("failed to start: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.failure("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.failure("stderr not captured"))?;

        let mut redirect = match self.stdout_file {
            Some(ref path) => Some(File::create(path).await.map_err(|e| {
                self.failure(format!("cannot write {}: {}", path.display(), e))
            })?),
            None => None,
        };

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_content = String::new();
        let mut stderr_content = String::new();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_lines.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(l)) => {
                            if let Some(ref mut file) = redirect {
                                file.write_all(l.as_bytes()).await?;
                                file.write_all(b"\n").await?;
                            } else {
                                sink.debug(&l);
                                stdout_content.push_str(&l);
                                stdout_content.push('\n');
                            }
                        }
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            sink.warn(&format!("error reading stdout: {}", e));
                            stdout_open = false;
                        }
                    }
                }
                line = stderr_lines.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(l)) => {
                            sink.debug(&l);
                            stderr_content.push_str(&l);
                            stderr_content.push('\n');
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            sink.warn(&format!("error reading stderr: {}", e));
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        if let Some(mut file) = redirect {
            file.flush().await?;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| self.failure(format!("process error: {}", e)))?;
        let exit_code = status.code().unwrap_or(-1);

        sink.debug(&format!(
            "command finished in {:?} with exit code {}",
            start.elapsed(),
            exit_code
        ));

        if !status.success() {
            let tail = stderr_content.lines().last().unwrap_or_default();
            let reason = if tail.is_empty() {
                format!("exit code {}", exit_code)
            } else {
                format!("exit code {}: {}", exit_code, tail)
            };
            sink.error(&format!("{} failed: {}", self.display(), reason));
            return Err(self.failure(reason));
        }

        Ok(CommandOutput {
            exit_code,
            stdout: stdout_content,
            stderr: stderr_content,
        })
    }
}

impl std::fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Role;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn sink(dir: &Path) -> LogSink {
        LogSink::open(Uuid::new_v4(), Role::Worker, dir.join("build.log")).unwrap()
    }

    #[test]
    fn test_display_joins_arguments() {
        let cmd = ShellCommand::new("spack")
            .args(["--env", "/ws"])
            .arg("concretize");
        assert_eq!(cmd.display(), "spack --env /ws concretize");
    }

    #[test]
    fn test_env_values_not_displayed() {
        let cmd = ShellCommand::shell("echo \"$TOKEN\"").with_env("TOKEN", "abc123");
        assert!(!cmd.display().contains("abc123"));
        assert!(!format!("{}", cmd).contains("abc123"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let sink = sink(dir.path());
        let out = ShellCommand::shell("echo hello; echo oops >&2")
            .run(&sink)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_redirects_stdout_to_file() {
        let dir = TempDir::new().unwrap();
        let sink = sink(dir.path());
        let target = dir.path().join("out.def");
        let out = ShellCommand::shell("printf 'Bootstrap: docker\\nFrom: x\\n'")
            .with_stdout_file(&target)
            .run(&sink)
            .await
            .unwrap();
        assert!(out.stdout.is_empty());
        let written = std::fs::read_to_string(target).unwrap();
        assert_eq!(written, "Bootstrap: docker\nFrom: x\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_build_step_failure() {
        let dir = TempDir::new().unwrap();
        let sink = sink(dir.path());
        let err = ShellCommand::shell("echo broken >&2; exit 3")
            .with_stage("containerize-build")
            .run(&sink)
            .await
            .unwrap_err();
        match err {
            PipelineError::BuildStepFailed { stage, reason, .. } => {
                assert_eq!(stage, "containerize-build");
                assert!(reason.contains("exit code 3"));
                assert!(reason.contains("broken"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_build_step_failure() {
        let dir = TempDir::new().unwrap();
        let sink = sink(dir.path());
        let err = ShellCommand::new("/nonexistent/envforge-missing-binary")
            .with_stage("stage")
            .run(&sink)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BuildStepFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cwd_and_env_are_applied() {
        let dir = TempDir::new().unwrap();
        let sink = sink(dir.path());
        let out = ShellCommand::shell("pwd; echo \"$GREETING\"")
            .with_cwd(dir.path())
            .with_env("GREETING", "hi")
            .run(&sink)
            .await
            .unwrap();
        let lines: Vec<&str> = out.stdout.lines().collect();
        assert_eq!(
            std::fs::canonicalize(lines[0]).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
        assert_eq!(lines[1], "hi");
    }
}
