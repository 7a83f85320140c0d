// src/config/validate.rs

use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::ServiceConfig;
use crate::engine::NormalizedTask;
use crate::errors::{Result, StepflowError};
use crate::exec::shell;
use crate::logging::parse_level_str;

/// Semantic checks on a parsed service config.
pub fn validate_service_config(cfg: &ServiceConfig) -> Result<()> {
    if cfg.engine.pool_size == Some(0) {
        return Err(StepflowError::ConfigError(
            "[engine].pool_size must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.engine.exec_timeout.is_some_and(|t| t.is_zero()) {
        return Err(StepflowError::ConfigError(
            "[engine].exec_timeout must be greater than zero".to_string(),
        ));
    }

    if cfg.engine.max_parallel_steps == Some(0) {
        return Err(StepflowError::ConfigError(
            "[engine].max_parallel_steps must be >= 1 (got 0)".to_string(),
        ));
    }

    if let Some(level) = cfg.log.level.as_deref() {
        if parse_level_str(level).is_none() {
            return Err(StepflowError::ConfigError(format!(
                "[log].level '{level}' is not one of error, warn, info, debug, trace"
            )));
        }
    }

    Ok(())
}

/// Check a normalised task before submission: every dependency resolves, no
/// step depends on itself, command types are known, and the graph is acyclic.
///
/// `prefixes` lists command-type prefixes served by non-process backends.
pub fn preflight(task: &NormalizedTask, prefixes: &[&str]) -> Result<()> {
    let names: HashSet<&str> = task.steps.iter().map(|s| s.name.as_str()).collect();

    for step in &task.steps {
        let known_backend = prefixes.iter().any(|p| step.kind.starts_with(p));
        if !known_backend && shell::lookup(&step.kind).is_none() {
            return Err(StepflowError::ConfigError(format!(
                "step '{}' has unsupported type '{}'",
                step.name, step.kind
            )));
        }

        for dep in &step.depends_on {
            if dep == &step.name {
                return Err(StepflowError::ConfigError(format!(
                    "step '{}' cannot depend on itself",
                    step.name
                )));
            }
            if !names.contains(dep.as_str()) {
                return Err(StepflowError::ConfigError(format!(
                    "step '{}' has unknown dependency '{}' in `depends_on`",
                    step.name, dep
                )));
            }
        }
    }

    // Edge direction: dependency -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for step in &task.steps {
        graph.add_node(step.name.as_str());
    }
    for step in &task.steps {
        for dep in &step.depends_on {
            graph.add_edge(dep.as_str(), step.name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(StepflowError::DagCycle(format!(
            "cycle detected in task '{}' involving step '{}'",
            task.id,
            cycle.node_id()
        ))),
    }
}
