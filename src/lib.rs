// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod registry;
pub mod store;
pub mod types;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::cli::{CliArgs, Command, RunArgs};
use crate::config::model::ServiceConfig;
use crate::config::{load_task_file, preflight};
use crate::engine::{Engine, NormalizedTask, TaskSpec};
use crate::store::{StateStore, TaskState};
use crate::types::State;

/// How often the CLI polls the store while waiting for a task.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs, cfg: ServiceConfig) -> Result<()> {
    match args.command {
        Command::Check(task_args) => {
            let (_, task) = load_task(&task_args.task, &cfg)?;
            println!(
                "task '{}' is valid ({} step(s))",
                task.id,
                task.steps.len()
            );
            Ok(())
        }
        Command::Run(run_args) => run_task_file(run_args, cfg).await,
    }
}

/// Load, normalise and preflight a task file. The returned spec carries the
/// resolved task id, which submission keeps.
fn load_task(path: &Path, cfg: &ServiceConfig) -> Result<(TaskSpec, NormalizedTask)> {
    let file = load_task_file(path).with_context(|| format!("loading task file {:?}", path))?;
    let mut spec = TaskSpec::from(file);
    let task = spec
        .clone()
        .normalize(cfg.engine_config().exec_timeout)
        .with_context(|| format!("normalising task file {:?}", path))?;
    preflight(&task, &[]).with_context(|| format!("validating task file {:?}", path))?;
    spec.id = Some(task.id.clone());
    Ok((spec, task))
}

async fn run_task_file(args: RunArgs, cfg: ServiceConfig) -> Result<()> {
    let (spec, task) = load_task(&args.task.task, &cfg)?;

    if args.dry_run {
        print_dry_run(&task);
        return Ok(());
    }

    let store = StateStore::open(cfg.store_options())?;
    let engine = Engine::new(cfg.engine_config(), store);
    let id = engine.submit(spec)?;
    info!(task = %id, "submitted task");

    let final_state = tokio::select! {
        state = engine.wait_for(&id, WAIT_POLL) => state,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for Ctrl+C");
            }
            warn!(task = %id, "interrupted; killing running steps");
            engine.shutdown_now().await?;
            engine.task(&id)
        }
    };

    print_report(&engine, &id, final_state.as_ref(), args.quiet);
    engine.shutdown().await?;

    match final_state {
        Some(state) if state.state == State::SystemError => {
            bail!("task '{id}' failed: {}", state.message)
        }
        Some(_) if engine.steps(&id).iter().any(|s| s.code != 0) => {
            bail!("task '{id}' finished with failed steps")
        }
        Some(_) => Ok(()),
        None => bail!("task '{id}' record expired before completion"),
    }
}

fn print_report(engine: &Engine, id: &str, state: Option<&TaskState>, quiet: bool) {
    let Some(state) = state else {
        println!("task {id}: no record");
        return;
    };

    println!("task {id}: {}", state.state);
    if !state.message.is_empty() {
        println!("  message: {}", state.message);
    }
    for (key, value) in &state.metadata {
        println!("  {key}: {value}");
    }

    for step in engine.steps(id) {
        println!("  [{}] {}: {} (code {})", step.index, step.name, step.state, step.code);
        if !step.message.is_empty() {
            println!("      message: {}", step.message);
        }
        if !quiet {
            for line in engine.outputs(id, step.index) {
                println!("      {:>4} | {}", line.line, line.content);
            }
        }
    }
}

/// Print the normalised plan without executing anything.
fn print_dry_run(task: &NormalizedTask) {
    println!("stepflow dry-run");
    println!("  task: {}", task.id);
    if let Some(timeout) = task.timeout {
        println!("  timeout: {timeout:?}");
    }
    for (key, value) in &task.metadata {
        println!("  {key}: {value}");
    }
    println!();

    println!("steps ({}):", task.steps.len());
    for step in &task.steps {
        println!("  - [{}] {}", step.index, step.name);
        println!("      type: {}", step.kind);
        println!("      timeout: {:?}", step.timeout);
        if !step.depends_on.is_empty() {
            println!("      depends_on: {:?}", step.depends_on);
        }
        if !step.env.is_empty() {
            println!("      env: {:?}", step.env.keys().collect::<Vec<_>>());
        }
    }

    debug!("dry-run complete (no execution)");
}
