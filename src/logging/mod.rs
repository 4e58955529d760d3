//! Per-run log sinks.
//!
//! Every run writes a log file into its workspace. Records go to that file and
//! to the process-wide subscriber installed by the binary, tagged with the run
//! id and the role (coordinator or worker) that emitted them.
//!
//! A sink can only be obtained for an active [`ExecutionScope`]; the coordinator
//! opens one per run and each worker opens one per stage job. Components that
//! log receive their sink explicitly.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::Dispatch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, Registry};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::PipelineError;

/// Which side of the pipeline is logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coordinator,
    Worker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Coordinator => write!(f, "coordinator"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

/// An active coordinator or worker execution for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionScope {
    pub run_id: Uuid,
    pub role: Role,
}

impl ExecutionScope {
    pub fn coordinator(run_id: Uuid) -> Self {
        Self {
            run_id,
            role: Role::Coordinator,
        }
    }

    pub fn worker(run_id: Uuid) -> Self {
        Self {
            run_id,
            role: Role::Worker,
        }
    }
}

/// Log destination for one run and role.
pub struct LogSink {
    run_id: Uuid,
    role: Role,
    path: PathBuf,
    dispatch: Dispatch,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("run_id", &self.run_id)
            .field("role", &self.role)
            .field("path", &self.path)
            .finish()
    }
}

macro_rules! emit {
    ($sink:expr, $level:ident, $message:expr) => {{
        let run_id = $sink.run_id;
        let role = $sink.role;
        let message: &str = $message;
        tracing::dispatcher::with_default(&$sink.dispatch, || {
            tracing::$level!(run_id = %run_id, role = %role, "{}", message);
        });
        tracing::$level!(run_id = %run_id, role = %role, "{}", message);
    }};
}

impl LogSink {
    /// Opens (appending) the log file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be created.
    pub fn open(run_id: Uuid, role: Role, path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file: File = OpenOptions::new().create(true).append(true).open(&path)?;

        let subscriber = Registry::default().with(LevelFilter::DEBUG).with(
            fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .with_target(false),
        );

        Ok(Self {
            run_id,
            role,
            path,
            dispatch: Dispatch::new(subscriber),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Path of the backing log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn debug(&self, message: &str) {
        emit!(self, debug, message);
    }

    pub fn info(&self, message: &str) {
        emit!(self, info, message);
    }

    pub fn warn(&self, message: &str) {
        emit!(self, warn, message);
    }

    pub fn error(&self, message: &str) {
        emit!(self, error, message);
    }
}

/// Hands out log sinks for active executions.
///
/// Sinks are cached per run and role, so repeated lookups within one execution
/// share a file handle.
pub struct ContextLogger {
    settings: Arc<Settings>,
    sinks: Mutex<HashMap<(Uuid, Role), Arc<LogSink>>>,
}

impl ContextLogger {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Path of the log file for `run_id`.
    pub fn log_path(&self, run_id: Uuid) -> PathBuf {
        self.settings
            .environments
            .path
            .join(run_id.to_string())
            .join(&self.settings.logging.filename)
    }

    /// Returns the sink for `scope`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns `InvalidLoggingContext` when called without an active execution.
    pub fn resolve(&self, scope: Option<&ExecutionScope>) -> Result<Arc<LogSink>, PipelineError> {
        let scope = scope.ok_or(PipelineError::InvalidLoggingContext)?;
        let key = (scope.run_id, scope.role);

        let mut sinks = self
            .sinks
            .lock()
            .map_err(|_| PipelineError::InvalidLoggingContext)?;
        if let Some(sink) = sinks.get(&key) {
            return Ok(Arc::clone(sink));
        }

        let sink = Arc::new(LogSink::open(
            scope.run_id,
            scope.role,
            self.log_path(scope.run_id),
        )?);
        sinks.insert(key, Arc::clone(&sink));
        Ok(sink)
    }

    /// Drops cached sinks for `run_id`, closing their files.
    pub fn release(&self, run_id: Uuid) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.retain(|(id, _), _| *id != run_id);
        }
    }
}
