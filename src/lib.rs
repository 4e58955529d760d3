//! envforge: distributed build pipeline for reproducible software environments.
//!
//! This library turns a named set of packages into a spack manifest, builds a
//! two-stage singularity image from it, publishes the image under the next
//! free version to every configured registry and renders a module file that
//! references it. Stages run on a worker pool fed by a shared queue.

// Core modules
pub mod cli;
pub mod config;
pub mod container;
pub mod error;
pub mod execution;
pub mod logging;
pub mod modulefile;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod spack;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::{ConfigError, Settings};
pub use error::{ErrorKind, PipelineError};
pub use pipeline::{EnvironmentModel, PipelineCoordinator, RunDescriptor, RunState};
