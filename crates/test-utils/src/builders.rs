#![allow(dead_code)]

use std::time::Duration;

use stepflow::engine::{StepSpec, TaskSpec};

/// Builder for `TaskSpec` to simplify test setup.
pub struct TaskBuilder {
    spec: TaskSpec,
}

impl TaskBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            spec: TaskSpec::default().with_id(id),
        }
    }

    /// Task without an id; one is generated on submission.
    pub fn anonymous() -> Self {
        Self {
            spec: TaskSpec::default(),
        }
    }

    pub fn with_step(mut self, step: StepBuilder) -> Self {
        self.spec.steps.push(step.build());
        self
    }

    pub fn sequential(mut self) -> Self {
        self.spec.sequential = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = Some(timeout);
        self
    }

    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.spec.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> TaskSpec {
        self.spec
    }
}

/// Builder for `StepSpec`.
pub struct StepBuilder {
    spec: StepSpec,
}

impl StepBuilder {
    /// A named step with the given command type and content.
    pub fn new(name: &str, kind: &str, content: &str) -> Self {
        Self {
            spec: StepSpec::new(kind, content).named(name),
        }
    }

    pub fn sh(name: &str, content: &str) -> Self {
        Self::new(name, "sh", content)
    }

    /// A step for the fake backend (`fake:` prefix).
    pub fn fake(name: &str) -> Self {
        Self::new(name, "fake:", "")
    }

    /// Step without a name; it gets `"<task id>-<index>"`.
    pub fn unnamed(kind: &str, content: &str) -> Self {
        Self {
            spec: StepSpec::new(kind, content),
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.spec.depends_on = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.spec.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> StepSpec {
        self.spec
    }
}
