// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ServiceConfig, TaskFile};
use crate::config::validate::validate_service_config;
use crate::errors::Result;

/// Read and parse a service config without semantic checks.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<ServiceConfig> {
    let contents = fs::read_to_string(path.as_ref())?;
    let config: ServiceConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Read, parse and validate a service config.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ServiceConfig> {
    let config = load_from_path(path)?;
    validate_service_config(&config)?;
    Ok(config)
}

/// Load the service config at `path`, or the defaults when no path is given
/// and `Stepflow.toml` does not exist in the working directory.
pub fn load_or_default(path: Option<&Path>) -> Result<ServiceConfig> {
    match path {
        Some(path) => load_and_validate(path),
        None => {
            let default = default_config_path();
            if default.is_file() {
                load_and_validate(default)
            } else {
                Ok(ServiceConfig::default())
            }
        }
    }
}

/// Read and parse a task file.
pub fn load_task_file(path: impl AsRef<Path>) -> Result<TaskFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    let task: TaskFile = toml::from_str(&contents)?;
    Ok(task)
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("Stepflow.toml")
}
