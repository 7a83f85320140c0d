// src/engine/mod.rs

//! Orchestration engine.
//!
//! - [`task`] holds the submission model and its normalisation.
//! - [`pool`] is the resizable bounded worker pool.
//! - [`dispatcher`] puts an unbounded FIFO in front of the pool.
//! - [`supervisor`] runs each submitted task as a dependency graph and keeps
//!   the state store up to date.

pub mod dispatcher;
pub mod pool;
pub mod supervisor;
pub mod task;

pub use dispatcher::{Dispatcher, PoolStats};
pub use pool::{Slot, WorkerPool};
pub use supervisor::{Engine, EngineConfig};
pub use task::{NormalizedStep, NormalizedTask, StepSpec, SubmitError, TaskSpec};
