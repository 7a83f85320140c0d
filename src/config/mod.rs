// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - [`model`] defines the service config and task file formats (TOML).
//! - [`loader`] reads them from disk.
//! - [`validate`] checks service settings and preflights task graphs.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, load_or_default, load_task_file};
pub use model::{EngineSection, LogSection, ServiceConfig, StepEntry, TaskFile};
pub use validate::{preflight, validate_service_config};
