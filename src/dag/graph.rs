// src/dag/graph.rs

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::builder::CompileError;

pub type VertexFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;
pub type VertexFn = Box<dyn FnOnce(CancellationToken) -> VertexFuture + Send + 'static>;

/// A vertex whose function returned an error (or panicked).
#[derive(Debug)]
pub struct VertexFailure {
    pub name: String,
    pub error: anyhow::Error,
}

impl fmt::Display for VertexFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.name, self.error)
    }
}

fn join_failures(failures: &[VertexFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of a graph run that did not complete cleanly.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("{} step(s) failed: {}", .0.len(), join_failures(.0))]
    Failed(Vec<VertexFailure>),

    #[error("cancelled before {} step(s) could start", .not_started.len())]
    Cancelled {
        not_started: Vec<String>,
        failures: Vec<VertexFailure>,
    },
}

impl GraphError {
    /// Whether this error describes a malformed graph rather than a runtime
    /// failure of one of its steps.
    pub fn is_structural(&self) -> bool {
        matches!(self, GraphError::Compile(_))
    }

    /// Step failures carried by this error, if any.
    pub fn failures(&self) -> &[VertexFailure] {
        match self {
            GraphError::Compile(_) => &[],
            GraphError::Failed(f) => f,
            GraphError::Cancelled { failures, .. } => failures,
        }
    }
}

pub(crate) struct Vertex {
    pub(crate) name: String,
    pub(crate) func: Option<VertexFn>,
    pub(crate) deps: Vec<String>,
    pub(crate) dependents: Vec<usize>,
    pub(crate) in_degree: usize,
}

/// Per-vertex execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VertexState {
    /// Waiting on `n` unfinished dependencies.
    Waiting(usize),
    Running,
    DoneOk,
    DoneErr,
}

/// A compiled, validated dependency graph ready to run.
pub struct Graph {
    vertices: Vec<Vertex>,
    roots: Vec<usize>,
    max_parallel: Option<usize>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("vertices", &self.vertices.len())
            .field("roots", &self.root_names())
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}

impl Graph {
    pub(crate) fn new(vertices: Vec<Vertex>, roots: Vec<usize>, max_parallel: Option<usize>) -> Self {
        Self {
            vertices,
            roots,
            max_parallel,
        }
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Names of the vertices without dependencies.
    pub fn root_names(&self) -> Vec<&str> {
        self.roots
            .iter()
            .map(|&i| self.vertices[i].name.as_str())
            .collect()
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.vertices.iter().map(|v| v.name.as_str())
    }

    /// Immediate dependencies of a step.
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.vertices
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a step.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.vertices
            .iter()
            .find(|v| v.name == name)
            .map(|v| {
                v.dependents
                    .iter()
                    .map(|&i| self.vertices[i].name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run every vertex in dependency order with maximal concurrency.
    ///
    /// - All roots start immediately.
    /// - A vertex starts as soon as its last dependency finishes successfully.
    /// - A failed vertex stops its own branch; independent branches continue.
    /// - Once `cancel` fires, no further vertices start. This includes
    ///   vertices still queued on the `max_parallel` limiter. Vertices already
    ///   running are left alone and awaited.
    ///
    /// Returns after every started vertex has finished.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), GraphError> {
        let limiter = self.max_parallel.map(|n| Arc::new(Semaphore::new(n)));

        let mut states: Vec<VertexState> = self
            .vertices
            .iter()
            .map(|v| VertexState::Waiting(v.in_degree))
            .collect();

        let mut set: JoinSet<Option<anyhow::Result<()>>> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut failures: Vec<VertexFailure> = Vec::new();

        let roots = std::mem::take(&mut self.roots);
        for idx in roots {
            if cancel.is_cancelled() {
                break;
            }
            self.start(idx, &mut states, &mut set, &mut running, &cancel, &limiter);
        }

        while let Some(joined) = set.join_next_with_id().await {
            let (idx, result) = match joined {
                Ok((id, result)) => (running.remove(&id), result),
                Err(join_err) => {
                    let result = if join_err.is_panic() {
                        Err(anyhow::anyhow!("step panicked"))
                    } else {
                        Err(anyhow::anyhow!("step was aborted"))
                    };
                    (running.remove(&join_err.id()), Some(result))
                }
            };

            let Some(idx) = idx else {
                warn!("finished vertex task not tracked by executor");
                continue;
            };

            // Cancelled while queued on the limiter; its function never ran.
            let Some(result) = result else {
                debug!(step = %self.vertices[idx].name, "cancelled before start");
                states[idx] = VertexState::Waiting(0);
                continue;
            };

            match result {
                Ok(()) => {
                    states[idx] = VertexState::DoneOk;
                    debug!(step = %self.vertices[idx].name, "vertex finished");

                    let dependents = self.vertices[idx].dependents.clone();
                    for dep in dependents {
                        if let VertexState::Waiting(n) = states[dep] {
                            let remaining = n.saturating_sub(1);
                            states[dep] = VertexState::Waiting(remaining);
                            if remaining == 0 {
                                if cancel.is_cancelled() {
                                    debug!(
                                        step = %self.vertices[dep].name,
                                        "cancelled; not scheduling ready vertex"
                                    );
                                    continue;
                                }
                                self.start(dep, &mut states, &mut set, &mut running, &cancel, &limiter);
                            }
                        }
                    }
                }
                Err(error) => {
                    states[idx] = VertexState::DoneErr;
                    warn!(
                        step = %self.vertices[idx].name,
                        error = %format!("{error:#}"),
                        "vertex failed; its dependents will not run"
                    );
                    failures.push(VertexFailure {
                        name: self.vertices[idx].name.clone(),
                        error,
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            let not_started: Vec<String> = self
                .vertices
                .iter()
                .zip(&states)
                .filter(|(_, s)| matches!(s, VertexState::Waiting(_)))
                .map(|(v, _)| v.name.clone())
                .collect();

            if !not_started.is_empty() {
                info!(not_started = ?not_started, "graph run cancelled");
                return Err(GraphError::Cancelled {
                    not_started,
                    failures,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(GraphError::Failed(failures))
        }
    }

    fn start(
        &mut self,
        idx: usize,
        states: &mut [VertexState],
        set: &mut JoinSet<Option<anyhow::Result<()>>>,
        running: &mut HashMap<tokio::task::Id, usize>,
        cancel: &CancellationToken,
        limiter: &Option<Arc<Semaphore>>,
    ) {
        let vertex = &mut self.vertices[idx];
        let Some(func) = vertex.func.take() else {
            warn!(step = %vertex.name, "vertex already started; refusing to run it twice");
            return;
        };

        debug!(step = %vertex.name, "dependencies satisfied; starting vertex");
        states[idx] = VertexState::Running;

        let token = cancel.clone();
        let limiter = limiter.clone();
        let handle = set.spawn(async move {
            let _permit = match limiter {
                Some(sem) => {
                    let acquired = tokio::select! {
                        biased;
                        _ = token.cancelled() => return None,
                        acquired = sem.acquire_owned() => acquired,
                    };
                    match acquired {
                        Ok(permit) => Some(permit),
                        Err(e) => return Some(Err(anyhow::anyhow!("step limiter closed: {e}"))),
                    }
                }
                None => None,
            };
            if token.is_cancelled() {
                return None;
            }
            Some(func(token).await)
        });
        running.insert(handle.id(), idx);
    }
}
