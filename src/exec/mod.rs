// src/exec/mod.rs

//! Step execution layer.
//!
//! - [`backend`] defines the [`StepRunner`] contract, the [`StepError`]
//!   taxonomy and the [`BackendRegistry`] that picks a runner by command type.
//! - [`process`] is the default runner: script staging, process-group launch,
//!   timeout / manual-stop race and output capture.
//! - [`shell`] maps command-type tags to interpreters and script suffixes.
//! - [`encoding`] handles legacy double-byte console output.

pub mod backend;
pub mod encoding;
pub mod process;
pub mod shell;

pub use backend::{
    BackendRegistry, ProcessBackend, RunFuture, RunnerFactory, StepContext, StepError, StepRunner,
    SYSTEM_EXIT_CODE,
};
pub use process::ProcessRunner;
