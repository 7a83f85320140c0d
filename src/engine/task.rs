// src/engine/task.rs

//! Submission model and normalisation.
//!
//! A [`TaskSpec`] is what callers hand to the supervisor. Before it is queued
//! it is turned into a [`NormalizedTask`]:
//!
//! - a missing task id is generated; a given one must be usable as a
//!   directory name and a store key segment;
//! - unnamed steps are called `"<task id>-<index>"`;
//! - in sequential mode each step depends on the one before it;
//! - step names must be unique;
//! - per-step timeouts default to the engine's execution timeout;
//! - `HARDWARE_ID` / `VM_INSTANCE_ID` found in step environments become
//!   task metadata.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path};
use std::time::Duration;

use thiserror::Error;

use crate::store::Metadata;

pub const ENV_HARDWARE_ID: &str = "HARDWARE_ID";
pub const ENV_VM_INSTANCE_ID: &str = "VM_INSTANCE_ID";
pub const META_HARDWARE_ID: &str = "hardware_id";
pub const META_VM_INSTANCE_ID: &str = "vm_instance_id";

const MAX_TASK_ID_LEN: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("task has no steps")]
    EmptyTask,

    #[error("duplicate step names: {}", format_repeats(.0))]
    DuplicateStepName(Vec<(String, usize)>),

    #[error("invalid task id {0:?}: must be a single path component without ':'")]
    InvalidTaskId(String),

    #[error("task '{0}' is already running")]
    TaskAlreadyRunning(String),

    #[error("engine is shutting down; not accepting tasks")]
    Closed,
}

fn format_repeats(repeats: &[(String, usize)]) -> String {
    repeats
        .iter()
        .map(|(name, count)| format!("{name} repeat count {count}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One step as submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSpec {
    /// Empty means "assign a name".
    pub name: String,
    /// Command type selecting the shell or backend.
    pub kind: String,
    pub content: String,
    pub env: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
    pub timeout: Option<Duration>,
}

impl StepSpec {
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A task as submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: Option<String>,
    pub steps: Vec<StepSpec>,
    /// Overall deadline after which no further steps are started.
    pub timeout: Option<Duration>,
    /// Chain each step onto the previous one, ignoring declared dependencies.
    pub sequential: bool,
    /// Extra metadata merged with what is extracted from step environments.
    pub metadata: Metadata,
}

impl TaskSpec {
    pub fn new(steps: Vec<StepSpec>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Apply naming, chaining, uniqueness and timeout defaults.
    pub fn normalize(self, exec_timeout: Duration) -> Result<NormalizedTask, SubmitError> {
        if self.steps.is_empty() {
            return Err(SubmitError::EmptyTask);
        }

        let id = match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => {
                validate_task_id(id)?;
                id.to_string()
            }
            _ => generate_task_id(),
        };

        let mut steps: Vec<NormalizedStep> = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                let name = match spec.name.trim() {
                    "" => format!("{id}-{index}"),
                    name => name.to_string(),
                };
                NormalizedStep {
                    index,
                    name,
                    kind: spec.kind.trim().to_string(),
                    content: spec.content,
                    env: spec.env,
                    depends_on: spec.depends_on,
                    timeout: spec
                        .timeout
                        .filter(|t| !t.is_zero())
                        .unwrap_or(exec_timeout),
                }
            })
            .collect();

        if self.sequential {
            chain_sequential(&mut steps);
        }

        check_unique_names(&steps)?;

        let mut metadata = extract_metadata(&steps);
        metadata.extend(self.metadata);

        Ok(NormalizedTask {
            id,
            steps,
            timeout: self.timeout.filter(|t| !t.is_zero()),
            metadata,
        })
    }
}

/// A step after normalisation; `index` is its position in the submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedStep {
    pub index: usize,
    pub name: String,
    pub kind: String,
    pub content: String,
    pub env: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTask {
    pub id: String,
    pub steps: Vec<NormalizedStep>,
    pub timeout: Option<Duration>,
    pub metadata: Metadata,
}

/// Random task id (UUID v4, simple form).
pub fn generate_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Task ids name the task's workspace directories and separate store key
/// segments, so they must be one plain path component with no `:`.
pub fn validate_task_id(id: &str) -> Result<(), SubmitError> {
    let invalid = || SubmitError::InvalidTaskId(id.to_string());

    if id.len() > MAX_TASK_ID_LEN
        || id.chars().any(|c| matches!(c, '/' | '\\' | ':') || c.is_control())
    {
        return Err(invalid());
    }

    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(invalid()),
    }
}

fn chain_sequential(steps: &mut [NormalizedStep]) {
    let mut previous: Option<String> = None;
    for step in steps.iter_mut() {
        step.depends_on = previous.iter().cloned().collect();
        previous = Some(step.name.clone());
    }
}

fn check_unique_names(steps: &[NormalizedStep]) -> Result<(), SubmitError> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for step in steps {
        *counts.entry(step.name.as_str()).or_default() += 1;
    }

    let mut repeats: Vec<(String, usize)> = counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, count)| (name.to_string(), count))
        .collect();

    if repeats.is_empty() {
        return Ok(());
    }
    repeats.sort();
    Err(SubmitError::DuplicateStepName(repeats))
}

/// Collect hardware / VM instance identifiers from step environments. Later
/// steps win.
pub fn extract_metadata(steps: &[NormalizedStep]) -> Metadata {
    let mut metadata = Metadata::new();
    for step in steps {
        for (env_key, meta_key) in [
            (ENV_HARDWARE_ID, META_HARDWARE_ID),
            (ENV_VM_INSTANCE_ID, META_VM_INSTANCE_ID),
        ] {
            if let Some(value) = step.env.get(env_key).filter(|v| !v.is_empty()) {
                metadata.insert(meta_key.to_string(), value.clone());
            }
        }
    }
    metadata
}
