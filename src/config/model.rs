// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::{EngineConfig, StepSpec, TaskSpec};
use crate::store::StoreOptions;
use crate::types::opt_duration;

/// Service configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// pool_size = 8
/// exec_timeout = "30m"
/// key_expire = "48h"
/// root_dir = "/var/lib/stepflow"
///
/// [log]
/// level = "info"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub log: LogSection,
}

/// `[engine]` section. Unset fields fall back to [`EngineConfig::default`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineSection {
    /// Number of tasks that may run at the same time.
    pub pool_size: Option<usize>,

    /// Default per-step timeout.
    #[serde(default, deserialize_with = "opt_duration::deserialize")]
    pub exec_timeout: Option<Duration>,

    /// Lifetime of task, step and output records.
    #[serde(default, deserialize_with = "opt_duration::deserialize")]
    pub key_expire: Option<Duration>,

    /// Parent directory for staged scripts and task workspaces.
    pub root_dir: Option<PathBuf>,

    /// Cap on concurrently running steps within one task.
    pub max_parallel_steps: Option<usize>,

    #[serde(default, deserialize_with = "opt_duration::deserialize")]
    pub sweep_interval: Option<Duration>,

    /// JSON snapshot written on store flush and loaded on start.
    pub snapshot: Option<PathBuf>,
}

/// `[log]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSection {
    /// `error`, `warn`, `info`, `debug` or `trace`.
    pub level: Option<String>,
}

impl ServiceConfig {
    /// Engine settings with defaults applied and key expiry normalised.
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let section = &self.engine;
        EngineConfig {
            pool_size: section.pool_size.unwrap_or(defaults.pool_size),
            exec_timeout: section.exec_timeout.unwrap_or(defaults.exec_timeout),
            key_expire: section.key_expire.unwrap_or(defaults.key_expire),
            root_dir: section.root_dir.clone().unwrap_or(defaults.root_dir),
            max_parallel_steps: section.max_parallel_steps,
            sweep_interval: section.sweep_interval.unwrap_or(defaults.sweep_interval),
        }
        .normalized()
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            snapshot_path: self.engine.snapshot.clone(),
        }
    }
}

/// A task as described in a TOML task file.
///
/// ```toml
/// id = "nightly"
/// timeout = "1h"
///
/// [[step]]
/// name = "build"
/// type = "bash"
/// content = "make"
///
/// [[step]]
/// name = "test"
/// type = "bash"
/// content = "make test"
/// depends_on = ["build"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFile {
    pub id: Option<String>,

    /// Overall task timeout.
    #[serde(default, deserialize_with = "opt_duration::deserialize")]
    pub timeout: Option<Duration>,

    /// Run steps one after another in file order.
    #[serde(default)]
    pub sequential: bool,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(default, rename = "step")]
    pub steps: Vec<StepEntry>,
}

/// One `[[step]]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepEntry {
    #[serde(default)]
    pub name: String,

    /// Command type (shell or backend prefix).
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default, deserialize_with = "opt_duration::deserialize")]
    pub timeout: Option<Duration>,
}

impl From<StepEntry> for StepSpec {
    fn from(entry: StepEntry) -> Self {
        StepSpec {
            name: entry.name,
            kind: entry.kind,
            content: entry.content,
            env: entry.env,
            depends_on: entry.depends_on,
            timeout: entry.timeout,
        }
    }
}

impl From<TaskFile> for TaskSpec {
    fn from(file: TaskFile) -> Self {
        TaskSpec {
            id: file.id,
            steps: file.steps.into_iter().map(StepSpec::from).collect(),
            timeout: file.timeout,
            sequential: file.sequential,
            metadata: file.metadata,
        }
    }
}
