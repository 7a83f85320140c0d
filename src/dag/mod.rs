// src/dag/mod.rs

//! Dependency graph of named steps.
//!
//! - [`builder`] collects steps and dependency declarations and compiles them,
//!   rejecting cycles, duplicate names and graphs without a root.
//! - [`graph`] runs a compiled graph with maximal concurrency, isolating
//!   failed branches and honouring cooperative cancellation.

pub mod builder;
pub mod graph;

pub use builder::{CompileError, GraphBuilder};
pub use graph::{Graph, GraphError, VertexFailure};
