// src/exec/backend.rs

//! Step runner contract and backend selection.
//!
//! Every way of executing a step implements [`StepRunner`]. The supervisor
//! never knows which concrete runner it drives: it asks a [`BackendRegistry`]
//! for the factory matching the step's command type and runs whatever comes
//! back.
//!
//! - [`ProcessRunner`](super::process::ProcessRunner) is the default backend.
//! - Additional backends (containers, checkouts, ...) register under a
//!   command-type prefix such as `"docker@"`.
//! - Tests register fake backends that never spawn processes.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::exec::process::ProcessRunner;
use crate::store::StateStore;

/// Exit code recorded for failures that are not the step program's own.
pub const SYSTEM_EXIT_CODE: i32 = 255;

/// Why a step did not succeed.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("failed to create script {path:?}: {source}")]
    ScriptCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unsupported command type '{0}'")]
    UnsupportedShell(String),

    #[error("failed to launch '{program}': {source}")]
    ProcessLaunchFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("exec timed out after {0:?}")]
    Timeout(Duration),

    #[error("manually stopped")]
    ManualStop,

    #[error("exit status {0}")]
    NonZeroExit(i32),

    #[error("step panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StepError {
    /// Exit code to record on the step: the program's own code for
    /// [`StepError::NonZeroExit`], [`SYSTEM_EXIT_CODE`] for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            StepError::NonZeroExit(code) => *code,
            _ => SYSTEM_EXIT_CODE,
        }
    }
}

/// Everything a runner needs to execute one step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub task_id: String,
    pub index: usize,
    pub name: String,
    /// Command type, e.g. `"bash"` or a backend prefix.
    pub kind: String,
    pub content: String,
    /// Caller-declared environment variables.
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    /// Lifetime of the task's records; output lines live for
    /// `key_ttl + timeout`.
    pub key_ttl: Duration,
    /// Working directory of the step process.
    pub workspace: PathBuf,
    /// Where staged scripts are written.
    pub script_dir: PathBuf,
}

/// Boxed future returned by [`StepRunner::run`].
pub type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StepError>> + Send + 'a>>;

/// Execution contract shared by all backends.
pub trait StepRunner: Send {
    /// Run the step to completion. `cancel` fires on manual stop.
    fn run(&mut self, cancel: CancellationToken) -> RunFuture<'_>;

    /// Release anything the run left behind. Called once after `run`,
    /// whatever its outcome.
    fn cleanup(&mut self) -> anyhow::Result<()>;
}

/// Creates runners for one backend.
pub trait RunnerFactory: Send + Sync {
    fn create(&self, ctx: StepContext, store: StateStore) -> Box<dyn StepRunner>;
}

impl<F> RunnerFactory for F
where
    F: Fn(StepContext, StateStore) -> Box<dyn StepRunner> + Send + Sync,
{
    fn create(&self, ctx: StepContext, store: StateStore) -> Box<dyn StepRunner> {
        self(ctx, store)
    }
}

/// Default backend: stage a script and run it as a local process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessBackend;

impl RunnerFactory for ProcessBackend {
    fn create(&self, ctx: StepContext, store: StateStore) -> Box<dyn StepRunner> {
        Box::new(ProcessRunner::new(ctx, store))
    }
}

/// Maps command-type prefixes to runner factories.
///
/// The longest matching prefix wins; anything unmatched goes to the default
/// backend.
#[derive(Clone)]
pub struct BackendRegistry {
    prefixed: Vec<(String, Arc<dyn RunnerFactory>)>,
    default: Arc<dyn RunnerFactory>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefixes: Vec<_> = self.prefixed.iter().map(|(p, _)| p.as_str()).collect();
        f.debug_struct("BackendRegistry")
            .field("prefixes", &prefixes)
            .finish_non_exhaustive()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_default(ProcessBackend)
    }
}

impl BackendRegistry {
    pub fn with_default(default: impl RunnerFactory + 'static) -> Self {
        Self {
            prefixed: Vec::new(),
            default: Arc::new(default),
        }
    }

    /// Route command types starting with `prefix` to `factory`.
    pub fn register(&mut self, prefix: impl Into<String>, factory: impl RunnerFactory + 'static) -> &mut Self {
        let prefix = prefix.into();
        self.prefixed.retain(|(p, _)| *p != prefix);
        self.prefixed.push((prefix, Arc::new(factory)));
        // Longest prefix first.
        self.prefixed.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn select(&self, kind: &str) -> &Arc<dyn RunnerFactory> {
        match self.prefixed.iter().find(|(p, _)| kind.starts_with(p.as_str())) {
            Some((prefix, factory)) => {
                debug!(kind, prefix = %prefix, "selected prefixed backend");
                factory
            }
            None => &self.default,
        }
    }

    pub fn create(&self, ctx: StepContext, store: StateStore) -> Box<dyn StepRunner> {
        self.select(&ctx.kind).create(ctx, store)
    }
}
