// src/registry.rs

//! Cancellation registry: maps task / step identifiers to cancellable tokens.
//!
//! Keys are `task#<id>` for whole tasks and `step#<id>#<n>` for individual
//! steps. A task-level stop only stops the DAG executor from scheduling new
//! steps; a step-level stop is observed by the process runner, which kills the
//! step's process group.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const TASK_PREFIX: &str = "task";
const STEP_PREFIX: &str = "step";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no active entry for {0}")]
    NotFound(String),
}

pub fn task_key(task: &str) -> String {
    format!("{TASK_PREFIX}#{task}")
}

pub fn step_key(task: &str, step: usize) -> String {
    format!("{STEP_PREFIX}#{task}#{step}")
}

/// Process-wide registry of cancellable tokens.
///
/// Cheap to clone and safe to share between tasks; callers never lock it.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    entries: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `key` with a fresh child of `parent` and return that child.
    ///
    /// Re-joining an existing key replaces the previous entry.
    pub fn join(&self, parent: &CancellationToken, key: impl Into<String>) -> CancellationToken {
        let key = key.into();
        let token = parent.child_token();
        if self.lock().insert(key.clone(), token.clone()).is_some() {
            debug!(key = %key, "replaced existing registry entry");
        }
        token
    }

    pub fn join_task(&self, parent: &CancellationToken, task: &str) -> CancellationToken {
        self.join(parent, task_key(task))
    }

    pub fn join_step(
        &self,
        parent: &CancellationToken,
        task: &str,
        step: usize,
    ) -> CancellationToken {
        self.join(parent, step_key(task, step))
    }

    /// Like [`join`](Self::join), but the returned [`Membership`] leaves the
    /// registry when dropped, including on unwinding.
    pub fn enter(&self, parent: &CancellationToken, key: impl Into<String>) -> Membership {
        let key = key.into();
        let token = self.join(parent, key.clone());
        Membership {
            registry: self.clone(),
            key,
            token,
        }
    }

    /// Like [`enter`](Self::enter), but only if `key` is not registered yet.
    /// The check and the insert happen under one lock.
    pub fn try_enter(&self, parent: &CancellationToken, key: impl Into<String>) -> Option<Membership> {
        let key = key.into();
        let token = {
            let mut entries = self.lock();
            if entries.contains_key(&key) {
                debug!(key = %key, "registry key already taken");
                return None;
            }
            let token = parent.child_token();
            entries.insert(key.clone(), token.clone());
            token
        };
        Some(Membership {
            registry: self.clone(),
            key,
            token,
        })
    }

    /// Whether the task currently has a registered token.
    pub fn is_active(&self, task: &str) -> bool {
        self.lock().contains_key(&task_key(task))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Cancel the token registered under `key`.
    ///
    /// The entry stays registered until its owner calls [`leave`](Self::leave);
    /// cancelling twice is harmless.
    pub fn request_stop(&self, key: &str) -> Result<(), RegistryError> {
        let token = self
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        info!(key, "stop requested");
        token.cancel();
        Ok(())
    }

    pub fn stop_task(&self, task: &str) -> Result<(), RegistryError> {
        self.request_stop(&task_key(task))
    }

    pub fn stop_step(&self, task: &str, step: usize) -> Result<(), RegistryError> {
        self.request_stop(&step_key(task, step))
    }

    /// Remove `key` without cancelling its token.
    pub fn leave(&self, key: &str) {
        if self.lock().remove(key).is_none() {
            debug!(key, "leave for unknown registry key");
        }
    }

    pub fn leave_task(&self, task: &str) {
        self.leave(&task_key(task));
    }

    pub fn leave_step(&self, task: &str, step: usize) {
        self.leave(&step_key(task, step));
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scoped registry entry; removes itself (without cancelling) on drop.
#[derive(Debug)]
pub struct Membership {
    registry: CancellationRegistry,
    key: String,
    token: CancellationToken,
}

impl Membership {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.registry.leave(&self.key);
    }
}
