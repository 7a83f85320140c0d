// src/engine/supervisor.rs

//! Task supervisor: accepts tasks, runs each one as a dependency graph of
//! step runners, and keeps the state store current.
//!
//! Lifecycle of one task:
//!
//! 1. `submit` normalises the [`TaskSpec`], claims the task id in the
//!    registry, clears records left by an earlier run of the same id, writes
//!    `Pending` task and step records and queues the task on the
//!    [`Dispatcher`].
//! 2. Once a pool slot is free the task starts its deadline timer, creates
//!    its workspace and moves to `Running`.
//! 3. Every step becomes a graph vertex that registers its own token, runs
//!    the selected [`StepRunner`] and records the outcome.
//! 4. The graph result decides the final task state: a malformed graph is a
//!    `SystemError`, anything else ends in `Stop` with failures recorded on
//!    the steps.
//! 5. The workspace is removed and the registry entry dropped regardless of
//!    outcome.

use std::any::Any;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dag::{GraphBuilder, GraphError};
use crate::engine::dispatcher::{Dispatcher, PoolStats};
use crate::engine::task::{NormalizedStep, NormalizedTask, SubmitError, TaskSpec};
use crate::exec::{BackendRegistry, StepContext, StepError, SYSTEM_EXIT_CODE};
use crate::registry::{self, CancellationRegistry, Membership, RegistryError};
use crate::store::records::now_nanos;
use crate::store::{StateStore, StepOutput, StepState, TaskState, Times};
use crate::types::{ListOrder, State};

/// Default per-step execution timeout.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// Default record lifetime.
pub const DEFAULT_KEY_EXPIRE: Duration = Duration::from_secs(48 * 60 * 60);
/// Default interval of the expired-record sweeper.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Runtime settings of an [`Engine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub pool_size: usize,
    pub exec_timeout: Duration,
    pub key_expire: Duration,
    /// Parent of the `scripts/` and `workspace/` directories.
    pub root_dir: PathBuf,
    /// Cap on concurrently running steps within one task; `None` = unbounded.
    pub max_parallel_steps: Option<usize>,
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            pool_size: cpus * 2,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            key_expire: DEFAULT_KEY_EXPIRE,
            root_dir: std::env::temp_dir().join("stepflow"),
            max_parallel_steps: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Raise `key_expire` to at least twice `exec_timeout`.
    pub fn normalized(mut self) -> Self {
        let floor = self.exec_timeout.saturating_mul(2);
        if self.key_expire < floor {
            info!(
                key_expire = ?self.key_expire,
                raised_to = ?floor,
                "key expiry shorter than twice the exec timeout; raising it"
            );
            self.key_expire = floor;
        }
        self.pool_size = self.pool_size.max(1);
        self
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root_dir.join("scripts")
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.root_dir.join("workspace")
    }
}

struct EngineInner {
    config: EngineConfig,
    store: StateStore,
    registry: CancellationRegistry,
    backends: BackendRegistry,
    dispatcher: Dispatcher,
    /// Parent of every task and step token.
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Entry point for submitting and observing tasks.
///
/// Cheap to clone; all clones drive the same pool and store.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine with the default process backend. Must be called from within a
    /// tokio runtime.
    pub fn new(config: EngineConfig, store: StateStore) -> Self {
        Self::with_backends(config, store, BackendRegistry::default())
    }

    pub fn with_backends(config: EngineConfig, store: StateStore, backends: BackendRegistry) -> Self {
        let config = config.normalized();
        let dispatcher = Dispatcher::new(config.pool_size);
        let sweeper = store.spawn_sweeper(config.sweep_interval);

        info!(
            pool_size = config.pool_size,
            exec_timeout = ?config.exec_timeout,
            key_expire = ?config.key_expire,
            root_dir = ?config.root_dir,
            "engine started"
        );

        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                registry: CancellationRegistry::new(),
                backends,
                dispatcher,
                shutdown: CancellationToken::new(),
                sweeper: Mutex::new(Some(sweeper)),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.inner.registry
    }

    /// Validate and queue a task. Returns its id.
    pub fn submit(&self, spec: TaskSpec) -> Result<String, SubmitError> {
        let inner = &self.inner;
        if inner.dispatcher.is_closed() {
            return Err(SubmitError::Closed);
        }

        let task = spec.normalize(inner.config.exec_timeout)?;

        // Held from here until the task has finished; a second submit of the
        // same id fails on the claim.
        let Some(membership) = inner
            .registry
            .try_enter(&inner.shutdown, registry::task_key(&task.id))
        else {
            return Err(SubmitError::TaskAlreadyRunning(task.id));
        };
        if inner
            .store
            .task(&task.id)
            .is_some_and(|state| !state.state.is_terminal())
        {
            return Err(SubmitError::TaskAlreadyRunning(task.id));
        }

        inner.store.clear_task_records(&task.id);

        let ttl = inner.config.key_expire;
        let state = TaskState {
            state: State::Pending,
            count: task.steps.len(),
            metadata: task.metadata.clone(),
            message: String::new(),
            times: Times {
                begin: Some(now_nanos()),
                ..Times::default()
            },
        };
        inner.store.set_task(&task.id, &state, ttl);

        for step in &task.steps {
            inner.store.set_step(&task.id, step.index, &pending_step(step), ttl);
        }

        let id = task.id.clone();
        inner
            .dispatcher
            .push(run_task(Arc::clone(inner), task, state, membership))?;

        info!(task = %id, waiting = inner.dispatcher.waiting(), "task queued");
        Ok(id)
    }

    /// Stop scheduling further steps of a task. Running steps continue; a
    /// task still waiting for a pool slot ends without starting any step.
    pub fn stop_task(&self, task: &str) -> Result<(), RegistryError> {
        self.inner.registry.stop_task(task)
    }

    /// Kill one running step.
    pub fn stop_step(&self, task: &str, index: usize) -> Result<(), RegistryError> {
        self.inner.registry.stop_step(task, index)
    }

    pub fn is_active(&self, task: &str) -> bool {
        self.inner.registry.is_active(task)
    }

    pub fn task(&self, task: &str) -> Option<TaskState> {
        self.inner.store.task(task)
    }

    pub fn list_tasks(&self, order: ListOrder) -> Vec<(String, TaskState)> {
        self.inner.store.list_tasks(order)
    }

    pub fn step(&self, task: &str, index: usize) -> Option<StepState> {
        self.inner.store.step(task, index)
    }

    pub fn steps(&self, task: &str) -> Vec<StepState> {
        self.inner.store.steps(task)
    }

    pub fn outputs(&self, task: &str, index: usize) -> Vec<StepOutput> {
        self.inner.store.outputs(task, index)
    }

    pub fn outputs_from(&self, task: &str, index: usize, from_line: u64) -> Vec<StepOutput> {
        self.inner.store.outputs_from(task, index, from_line)
    }

    pub fn output_done(&self, task: &str, index: usize) -> Option<u64> {
        self.inner.store.output_done(task, index)
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.dispatcher.stats()
    }

    pub fn resize_pool(&self, size: usize) {
        self.inner.dispatcher.resize(size);
    }

    /// Poll until the task reaches a terminal state or its record disappears.
    pub async fn wait_for(&self, task: &str, poll: Duration) -> Option<TaskState> {
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            match self.inner.store.task(task) {
                Some(state) if state.state.is_terminal() => return Some(state),
                Some(_) => {}
                None => return None,
            }
        }
    }

    /// Stop accepting tasks, wait for queued and running ones, then close
    /// the store.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let inner = &self.inner;
        inner.dispatcher.close();
        inner.dispatcher.drain().await;

        let sweeper = inner
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = sweeper {
            handle.abort();
        }

        inner.store.close().context("closing state store")?;
        info!("engine shut down");
        Ok(())
    }

    /// Like [`shutdown`](Self::shutdown), but kills every running step first.
    pub async fn shutdown_now(&self) -> anyhow::Result<()> {
        warn!("cancelling all running tasks");
        self.inner.dispatcher.close();
        self.inner.shutdown.cancel();
        self.shutdown().await
    }
}

fn pending_step(step: &NormalizedStep) -> StepState {
    StepState {
        index: step.index,
        name: step.name.clone(),
        state: State::Pending,
        code: 0,
        message: String::new(),
        depends_on: step.depends_on.clone(),
        times: Times::default(),
    }
}

/// Body of one queued task.
async fn run_task(
    inner: Arc<EngineInner>,
    task: NormalizedTask,
    mut state: TaskState,
    membership: Membership,
) {
    let ttl = inner.config.key_expire;
    let task_token = membership.token().clone();

    let dirs = match task_dirs(&inner.config, &task.id) {
        Ok(dirs) => dirs,
        Err(e) => {
            error!(task = %task.id, error = %format!("{e:#}"), "refusing task directories");
            state.advance(State::SystemError);
            state.message = format!("{e:#}");
            fail_pending_steps(&inner, &task, "task workspace could not be created");
            drop(membership);
            finish(&inner, &task.id, &mut state, None).await;
            return;
        }
    };
    let (workspace, script_dir) = (&dirs.workspace, &dirs.script_dir);

    let deadline = task.timeout.map(|timeout| {
        let token = task_token.clone();
        let id = task.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!(task = %id, ?timeout, "task timeout elapsed; no further steps will start");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    });

    if let Err(e) = create_dirs(workspace, script_dir).await {
        error!(task = %task.id, error = %format!("{e:#}"), "failed to prepare task workspace");
        if let Some(handle) = deadline {
            handle.abort();
        }
        state.advance(State::SystemError);
        state.message = format!("{e:#}");
        fail_pending_steps(&inner, &task, "task workspace could not be created");
        drop(membership);
        finish(&inner, &task.id, &mut state, Some(&dirs)).await;
        return;
    }

    state.advance(State::Running);
    inner.store.set_task(&task.id, &state, ttl);
    info!(task = %task.id, steps = task.steps.len(), "task running");

    let mut builder = GraphBuilder::new();
    if let Some(limit) = inner.config.max_parallel_steps {
        builder.max_parallel(limit);
    }
    for step in &task.steps {
        let ctx = StepContext {
            task_id: task.id.clone(),
            index: step.index,
            name: step.name.clone(),
            kind: step.kind.clone(),
            content: step.content.clone(),
            env: step.env.clone(),
            timeout: step.timeout,
            key_ttl: ttl,
            workspace: workspace.clone(),
            script_dir: script_dir.clone(),
        };
        let inner = Arc::clone(&inner);
        let depends_on = step.depends_on.clone();
        builder.add_step(step.name.clone(), move |_| run_step(inner, ctx, depends_on));
        builder.declare_dependency(&step.name, step.depends_on.iter().cloned());
    }

    let result = builder.run(task_token.clone()).await;

    match &result {
        Ok(()) => {
            state.advance(State::Stop);
            info!(task = %task.id, "task finished");
        }
        Err(e @ GraphError::Compile(_)) => {
            state.advance(State::SystemError);
            state.message = e.to_string();
            error!(task = %task.id, error = %e, "task graph rejected");
            fail_pending_steps(&inner, &task, &e.to_string());
        }
        Err(e) => {
            state.advance(State::Stop);
            state.message = e.to_string();
            warn!(task = %task.id, error = %e, "task finished with failures");
            let reason = match e {
                GraphError::Cancelled { .. } => "not started: task was stopped",
                _ => "not started: a dependency failed",
            };
            skip_pending_steps(&inner, &task, reason);
        }
    }

    if let Some(handle) = deadline {
        handle.abort();
    }

    // Leave the registry before the terminal state is written.
    drop(membership);
    finish(&inner, &task.id, &mut state, Some(&dirs)).await;
}

/// Per-task directories under the engine root.
struct TaskDirs {
    workspace: PathBuf,
    script_dir: PathBuf,
}

fn task_dirs(config: &EngineConfig, task: &str) -> anyhow::Result<TaskDirs> {
    Ok(TaskDirs {
        workspace: task_dir(config.workspace_dir(), task)?,
        script_dir: task_dir(config.scripts_dir(), task)?,
    })
}

/// `base/<task>`, refusing any id that would not land directly under `base`.
fn task_dir(base: PathBuf, task: &str) -> anyhow::Result<PathBuf> {
    let dir = base.join(task);
    let mut rest = dir
        .strip_prefix(&base)
        .map(|rest| rest.components())
        .with_context(|| format!("task id {task:?} escapes {base:?}"))?;
    let single = matches!((rest.next(), rest.next()), (Some(Component::Normal(_)), None));
    if !single {
        anyhow::bail!("task id {task:?} escapes {base:?}");
    }
    Ok(dir)
}

async fn create_dirs(workspace: &Path, script_dir: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(workspace)
        .await
        .with_context(|| format!("creating workspace {:?}", workspace))?;
    tokio::fs::create_dir_all(script_dir)
        .await
        .with_context(|| format!("creating script dir {:?}", script_dir))?;
    Ok(())
}

/// Record the end time and remove the task's directories.
async fn finish(inner: &EngineInner, task: &str, state: &mut TaskState, dirs: Option<&TaskDirs>) {
    let dirs = dirs
        .into_iter()
        .flat_map(|d| [d.workspace.as_path(), d.script_dir.as_path()]);
    for dir in dirs {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(task, dir = ?dir, "removed task directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(task, dir = ?dir, error = %e, "failed to remove task directory"),
        }
    }

    state.times.end = Some(now_nanos());
    inner.store.set_task(task, state, inner.config.key_expire);
}

/// Mark every step that never left `Pending` as a system error.
fn fail_pending_steps(inner: &EngineInner, task: &NormalizedTask, reason: &str) {
    finalize_pending_steps(inner, task, State::SystemError, reason);
}

/// Mark every step that never left `Pending` as stopped without running.
fn skip_pending_steps(inner: &EngineInner, task: &NormalizedTask, reason: &str) {
    finalize_pending_steps(inner, task, State::Stop, reason);
}

fn finalize_pending_steps(inner: &EngineInner, task: &NormalizedTask, next: State, reason: &str) {
    let ttl = inner.config.key_expire;
    for step in &task.steps {
        let mut record = inner
            .store
            .step(&task.id, step.index)
            .unwrap_or_else(|| pending_step(step));
        if record.state != State::Pending {
            continue;
        }
        record.advance(next);
        record.code = SYSTEM_EXIT_CODE;
        record.message = reason.to_string();
        record.times.end = Some(now_nanos());
        inner.store.set_step(&task.id, step.index, &record, ttl);
    }
}

/// Graph vertex body for one step.
async fn run_step(inner: Arc<EngineInner>, ctx: StepContext, depends_on: Vec<String>) -> anyhow::Result<()> {
    let ttl = ctx.key_ttl;
    let task_id = ctx.task_id.clone();
    let index = ctx.index;

    // Derived from the engine token: stopping the task does not kill steps.
    let membership = inner
        .registry
        .enter(&inner.shutdown, registry::step_key(&task_id, index));

    let mut record = StepState {
        index,
        name: ctx.name.clone(),
        state: State::Running,
        code: 0,
        message: String::new(),
        depends_on,
        times: Times {
            begin: Some(now_nanos()),
            ..Times::default()
        },
    };
    inner.store.set_step(&task_id, index, &record, ttl);
    info!(task = %task_id, step = index, step_name = %ctx.name, kind = %ctx.kind, "step started");

    let mut runner = inner.backends.create(ctx, inner.store.clone());
    let token = membership.token().clone();
    let handle = tokio::spawn(async move {
        let result = runner.run(token).await;
        if let Err(e) = runner.cleanup() {
            warn!(error = %format!("{e:#}"), "step cleanup failed");
        }
        result
    });

    let result = match handle.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            Err(StepError::Panicked(panic_message(join_err.into_panic())))
        }
        Err(join_err) => Err(StepError::Panicked(join_err.to_string())),
    };

    record.advance(State::Stop);
    record.times.end = Some(now_nanos());
    match &result {
        Ok(()) => {
            record.code = 0;
            info!(task = %task_id, step = index, "step succeeded");
        }
        Err(e) => {
            record.code = e.exit_code();
            record.message = e.to_string();
            warn!(task = %task_id, step = index, exit_code = record.code, error = %e, "step failed");
        }
    }
    inner.store.set_step(&task_id, index, &record, ttl);

    drop(membership);
    result.map_err(anyhow::Error::from)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
