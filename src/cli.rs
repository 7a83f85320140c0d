// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `stepflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "stepflow",
    version,
    about = "Run multi-step tasks whose steps form a dependency graph.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the service config file (TOML).
    ///
    /// Default: `Stepflow.toml` in the current working directory, if present.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `STEPFLOW_LOG`, the config file or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Submit a task file, wait for it to finish and print the result.
    Run(RunArgs),
    /// Validate a task file without running it.
    Check(TaskArgs),
}

#[derive(Debug, Clone, Args)]
pub struct TaskArgs {
    /// Path to the task file (TOML).
    #[arg(long, value_name = "PATH")]
    pub task: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub task: TaskArgs,

    /// Print the normalised plan, but don't execute any step.
    #[arg(long)]
    pub dry_run: bool,

    /// Don't print captured step output.
    #[arg(long)]
    pub quiet: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
