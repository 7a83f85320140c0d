// src/store/keys.rs

//! Key scheme for persisted records.
//!
//! | key                                   | value        |
//! |---------------------------------------|--------------|
//! | `task:<task>`                         | `TaskState`  |
//! | `step:<task>:<index>`                 | `StepState`  |
//! | `output:<task>:<index>:<line>`        | `StepOutput` |
//! | `output:<task>:<index>_done`          | line count   |
//!
//! Step indexes and line numbers are zero-padded; a prefix scan returns
//! them in numeric order.

pub const TASK_PREFIX: &str = "task";
pub const STEP_PREFIX: &str = "step";
pub const OUTPUT_PREFIX: &str = "output";

pub fn task_key(task: &str) -> String {
    format!("{TASK_PREFIX}:{task}")
}

pub fn all_tasks_prefix() -> String {
    format!("{TASK_PREFIX}:")
}

pub fn step_key(task: &str, index: usize) -> String {
    format!("{STEP_PREFIX}:{task}:{index:06}")
}

pub fn steps_prefix(task: &str) -> String {
    format!("{STEP_PREFIX}:{task}:")
}

pub fn output_key(task: &str, index: usize, line: u64) -> String {
    format!("{OUTPUT_PREFIX}:{task}:{index:06}:{line:012}")
}

/// Every output line and done sentinel of every step of a task.
pub fn task_outputs_prefix(task: &str) -> String {
    format!("{OUTPUT_PREFIX}:{task}:")
}

pub fn outputs_prefix(task: &str, index: usize) -> String {
    format!("{OUTPUT_PREFIX}:{task}:{index:06}:")
}

pub fn output_done_key(task: &str, index: usize) -> String {
    format!("{OUTPUT_PREFIX}:{task}:{index:06}_done")
}
