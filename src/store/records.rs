// src/store/records.rs

//! Record types persisted in the [`StateStore`] and typed accessors for them.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::store::keys;
use crate::store::StateStore;
use crate::types::{ListOrder, State};

/// Free-form key facts about a task (e.g. `hardware_id`, `vm_instance_id`).
pub type Metadata = BTreeMap<String, String>;

/// Wall-clock bookkeeping for a task or step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Times {
    /// Start timestamp (unix nanoseconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin: Option<i64>,
    /// End timestamp (unix nanoseconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    /// Remaining lifetime of the record; filled in at read time, never stored.
    #[serde(skip)]
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub state: State,
    /// Declared step count.
    pub count: usize,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub times: Times,
}

impl TaskState {
    /// Move to `next` unless that would regress the lifecycle.
    ///
    /// Returns whether the transition was applied.
    pub fn advance(&mut self, next: State) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub index: usize,
    pub name: String,
    pub state: State,
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub times: Times,
}

impl StepState {
    pub fn advance(&mut self, next: State) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

/// One captured output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub line: u64,
    /// Capture timestamp (unix nanoseconds).
    pub timestamp: i64,
    pub content: String,
}

/// Current wall-clock time as unix nanoseconds.
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

impl StateStore {
    pub fn set_task(&self, task: &str, state: &TaskState, ttl: Duration) {
        self.put(&keys::task_key(task), state, ttl);
    }

    /// Read a task's state with `times.ttl` set to its remaining lifetime.
    pub fn task(&self, task: &str) -> Option<TaskState> {
        let stored = self.get::<TaskState>(&keys::task_key(task))?;
        let mut state = stored.value;
        state.times.ttl = stored.remaining;
        Some(state)
    }

    /// All live tasks, sorted according to `order`.
    pub fn list_tasks(&self, order: ListOrder) -> Vec<(String, TaskState)> {
        let prefix = keys::all_tasks_prefix();
        let mut tasks: Vec<(String, TaskState)> = self
            .scan_prefix::<TaskState>(&prefix)
            .into_iter()
            .map(|(key, stored)| {
                let id = key.strip_prefix(prefix.as_str()).unwrap_or(&key).to_string();
                let mut state = stored.value;
                state.times.ttl = stored.remaining;
                (id, state)
            })
            .collect();

        match order {
            ListOrder::StartTime => tasks.sort_by_key(|(_, s)| s.times.begin),
            ListOrder::EndTime => tasks.sort_by_key(|(_, s)| s.times.end),
            ListOrder::RemainingTtl => tasks.sort_by_key(|(_, s)| s.times.ttl),
        }
        tasks
    }

    pub fn set_step(&self, task: &str, index: usize, state: &StepState, ttl: Duration) {
        self.put(&keys::step_key(task, index), state, ttl);
    }

    pub fn step(&self, task: &str, index: usize) -> Option<StepState> {
        let stored = self.get::<StepState>(&keys::step_key(task, index))?;
        let mut state = stored.value;
        state.times.ttl = stored.remaining;
        Some(state)
    }

    /// All live step states of a task ordered by step index.
    pub fn steps(&self, task: &str) -> Vec<StepState> {
        let mut steps: Vec<StepState> = self
            .scan_prefix::<StepState>(&keys::steps_prefix(task))
            .into_iter()
            .map(|(_, stored)| {
                let mut state = stored.value;
                state.times.ttl = stored.remaining;
                state
            })
            .collect();
        steps.sort_by_key(|s| s.index);
        steps
    }

    /// Drop all step and output records of a task, keeping the task record.
    pub fn clear_task_records(&self, task: &str) {
        let steps = self.delete_prefix(&keys::steps_prefix(task));
        let outputs = self.delete_prefix(&keys::task_outputs_prefix(task));
        if steps + outputs > 0 {
            debug!(task, steps, outputs, "cleared records of previous run");
        }
    }

    pub fn append_output(&self, task: &str, index: usize, output: &StepOutput, ttl: Duration) {
        self.put(&keys::output_key(task, index, output.line), output, ttl);
    }

    /// All captured lines of a step ordered by line number.
    pub fn outputs(&self, task: &str, index: usize) -> Vec<StepOutput> {
        self.outputs_from(task, index, 1)
    }

    /// Captured lines with `line >= from_line`, for incremental polling.
    pub fn outputs_from(&self, task: &str, index: usize, from_line: u64) -> Vec<StepOutput> {
        let mut lines: Vec<StepOutput> = self
            .scan_prefix::<StepOutput>(&keys::outputs_prefix(task, index))
            .into_iter()
            .map(|(_, stored)| stored.value)
            .filter(|o| o.line >= from_line)
            .collect();
        lines.sort_by_key(|o| o.line);
        lines
    }

    pub fn set_output_done(&self, task: &str, index: usize, count: u64, ttl: Duration) {
        self.put_raw(&keys::output_done_key(task, index), count.to_string(), ttl);
    }

    /// Final line count of a finished output stream, or `None` while the step
    /// is still producing output (or after the record expired).
    pub fn output_done(&self, task: &str, index: usize) -> Option<u64> {
        let key = keys::output_done_key(task, index);
        let raw = self.get_raw(&key)?;
        match raw.value.parse::<u64>() {
            Ok(n) => Some(n),
            Err(e) => {
                error!(key = %key, error = %e, "invalid output done sentinel");
                None
            }
        }
    }
}
