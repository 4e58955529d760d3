//! External command execution for build steps.
//!
//! # Example
//!
//! ```ignore
//! use envforge::execution::ShellCommand;
//!
//! ShellCommand::new("spack")
//!     .args(["--env", "/tmp/ws", "concretize"])
//!     .with_stage("stage")
//!     .run(&sink)
//!     .await?;
//! ```

pub mod shell;

pub use shell::{CommandOutput, ShellCommand};
