// src/dag/builder.rs

//! Collects named steps and their dependency declarations and compiles them
//! into an executable [`Graph`].

use std::collections::HashMap;
use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dag::graph::{Graph, GraphError, Vertex, VertexFn};

/// Structural problems found while compiling a graph.
///
/// These describe a malformed submission, not a runtime fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("dependency cycle detected at step '{0}'")]
    CycleDetected(String),

    #[error("empty graph: no step without dependencies to start from")]
    EmptyGraph,

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{0}' was added more than once")]
    DuplicateStep(String),
}

struct PendingVertex {
    name: String,
    func: VertexFn,
    deps: Vec<String>,
}

/// Builder for a dependency graph of named steps.
#[derive(Default)]
pub struct GraphBuilder {
    vertices: Vec<PendingVertex>,
    duplicates: Vec<String>,
    max_parallel: Option<usize>,
}

impl std::fmt::Debug for GraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.vertices.iter().map(|v| v.name.as_str()).collect();
        f.debug_struct("GraphBuilder")
            .field("vertices", &names)
            .field("max_parallel", &self.max_parallel)
            .finish_non_exhaustive()
    }
}

/// Node colour for the depth-first cycle search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not visited yet.
    White,
    /// On the current DFS stack.
    Gray,
    /// Fully explored.
    Black,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit how many vertices of this graph may run at the same time.
    pub fn max_parallel(&mut self, limit: usize) -> &mut Self {
        self.max_parallel = Some(limit.max(1));
        self
    }

    /// Add a step. Its function receives the graph's cancellation token.
    pub fn add_step<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.vertices.iter().any(|v| v.name == name) {
            self.duplicates.push(name);
            return self;
        }
        self.vertices.push(PendingVertex {
            name,
            func: Box::new(move |token| Box::pin(f(token))),
            deps: Vec::new(),
        });
        self
    }

    /// Declare that `step` runs only after every step in `depends_on`.
    ///
    /// Declarations for an unknown `step` are ignored; unknown names in
    /// `depends_on` are reported by [`compile`](Self::compile).
    pub fn declare_dependency<I, S>(&mut self, step: &str, depends_on: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self.vertices.iter_mut().find(|v| v.name == step) {
            Some(vertex) => {
                for dep in depends_on {
                    let dep = dep.into();
                    if !vertex.deps.contains(&dep) {
                        vertex.deps.push(dep);
                    }
                }
            }
            None => debug!(step, "dependency declared for unknown step; ignoring"),
        }
        self
    }

    /// Validate the declarations and build the executable graph.
    ///
    /// Checks run in this order: duplicate names, cycles, empty root set,
    /// unresolved dependency names. Unresolved dependencies still count
    /// towards a step's in-degree, so a graph where every step has one is an
    /// [`CompileError::EmptyGraph`].
    pub fn compile(self) -> Result<Graph, CompileError> {
        if let Some(name) = self.duplicates.into_iter().next() {
            return Err(CompileError::DuplicateStep(name));
        }

        let index: HashMap<&str, usize> = self
            .vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (v.name.as_str(), i))
            .collect();

        // Adjacency: parent -> dependents.
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.vertices.len()];
        let mut in_degree: Vec<usize> = vec![0; self.vertices.len()];
        let mut unknown: Option<(String, String)> = None;

        for (i, vertex) in self.vertices.iter().enumerate() {
            in_degree[i] = vertex.deps.len();
            for dep in &vertex.deps {
                match index.get(dep.as_str()) {
                    Some(&parent) => dependents[parent].push(i),
                    None => {
                        if unknown.is_none() {
                            unknown = Some((vertex.name.clone(), dep.clone()));
                        }
                    }
                }
            }
        }

        if let Some(at) = find_cycle(&dependents) {
            return Err(CompileError::CycleDetected(self.vertices[at].name.clone()));
        }

        let roots: Vec<usize> = (0..self.vertices.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        if roots.is_empty() {
            return Err(CompileError::EmptyGraph);
        }

        if let Some((step, dependency)) = unknown {
            return Err(CompileError::UnknownDependency { step, dependency });
        }

        let vertices = self
            .vertices
            .into_iter()
            .zip(dependents)
            .zip(in_degree)
            .map(|((pending, dependents), in_degree)| Vertex {
                name: pending.name,
                func: Some(pending.func),
                deps: pending.deps,
                dependents,
                in_degree,
            })
            .collect();

        Ok(Graph::new(vertices, roots, self.max_parallel))
    }

    /// Compile and run in one go.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), GraphError> {
        let graph = self.compile()?;
        graph.run(cancel).await
    }
}

/// White/gray/black depth-first search over `dependents`.
///
/// Returns the index of a vertex found on a back edge, if any.
fn find_cycle(dependents: &[Vec<usize>]) -> Option<usize> {
    let mut color = vec![Color::White; dependents.len()];

    for start in 0..dependents.len() {
        if color[start] != Color::White {
            continue;
        }

        // Explicit stack of (vertex, next child position).
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        color[start] = Color::Gray;

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            if let Some(&child) = dependents[node].get(top.1) {
                top.1 += 1;
                match color[child] {
                    Color::Gray => return Some(child),
                    Color::White => {
                        color[child] = Color::Gray;
                        stack.push((child, 0));
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }

    None
}
