//! Environment build pipeline.
//!
//! # Architecture
//!
//! - **Coordinator**: validates requests, owns run descriptors and submits
//!   stages to the scheduler queue one at a time
//! - **Stages**: the worker-side implementation of each pipeline step
//! - **Context**: the versioned run state exchanged between the two
//!
//! # Pipeline Flow
//!
//! 1. **stage**: create the package manager environment in the run workspace
//! 2. **create-manifest**: add the requested packages and patch the manifest
//! 3. **containerize-build**: build the sandbox that compiles the packages
//! 4. **containerize-final**: build the final image on the runtime base image
//! 5. **publish**: negotiate the next version and push to every registry
//! 6. **render-modulefile**: render the module file for the published image
//!
//! # Example
//!
//! ```rust,ignore
//! use envforge::pipeline::{EnvironmentModel, PipelineCoordinator};
//!
//! let coordinator = PipelineCoordinator::new(settings, queue, logger);
//! let run = coordinator
//!     .submit("users/alice/tools", EnvironmentModel::new("tools", ["zlib"]))
//!     .await?;
//! let finished = coordinator.wait(run.id, Duration::from_secs(1)).await?;
//! ```

pub mod context;
pub mod orchestrator;
pub mod stages;

pub use context::{EnvironmentContext, EnvironmentModel, CONTEXT_SCHEMA_VERSION};
pub use orchestrator::{PipelineCoordinator, RunDescriptor, RunFailure, RunState, RunStatus};
pub use stages::{Stage, StageRunner};
