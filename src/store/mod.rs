// src/store/mod.rs

//! Embedded, TTL-aware key/value store holding task, step and output records.
//!
//! - [`keys`] defines the key scheme (`task:`, `step:`, `output:` prefixes).
//! - [`records`] defines the record types and typed accessors on top of the
//!   raw store.
//!
//! Write failures (serialization, closed store) are logged and dropped; they
//! never surface to the caller.
//!
//! Expiry uses a monotonic [`Instant`]. The remaining TTL reported on read
//! never goes negative.

pub mod keys;
pub mod records;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub use records::{Metadata, StepOutput, StepState, TaskState, Times};

/// Options used when opening a [`StateStore`].
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Where `flush()` writes a JSON snapshot of live records. When the file
    /// exists at open time, its unexpired records are loaded back.
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    key: String,
    value: String,
    /// Remaining lifetime in milliseconds at flush time; `None` = no expiry.
    ttl_ms: Option<u64>,
}

#[derive(Debug)]
struct StoreInner {
    entries: RwLock<BTreeMap<String, Entry>>,
    closed: AtomicBool,
    snapshot_path: Option<PathBuf>,
}

/// A value read back from the store together with its remaining lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub value: T,
    /// `None` means the record never expires.
    pub remaining: Option<Duration>,
}

/// Ordered, concurrency-safe key/value store with per-key TTL.
///
/// Cheap to clone; all clones share the same underlying map.
#[derive(Debug, Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl StateStore {
    /// Purely in-memory store without snapshot support.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: RwLock::new(BTreeMap::new()),
                closed: AtomicBool::new(false),
                snapshot_path: None,
            }),
        }
    }

    /// Open a store, loading the snapshot file if one is configured and present.
    pub fn open(options: StoreOptions) -> Result<Self> {
        let mut entries = BTreeMap::new();

        if let Some(path) = options.snapshot_path.as_ref() {
            if path.is_file() {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("reading store snapshot at {:?}", path))?;
                let records: Vec<SnapshotRecord> = serde_json::from_str(&contents)
                    .with_context(|| format!("parsing store snapshot at {:?}", path))?;
                let now = Instant::now();
                for rec in records {
                    let expires_at = rec.ttl_ms.map(|ms| now + Duration::from_millis(ms));
                    entries.insert(
                        rec.key,
                        Entry {
                            value: rec.value,
                            expires_at,
                        },
                    );
                }
                info!(path = ?path, records = entries.len(), "loaded store snapshot");
            }
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                entries: RwLock::new(entries),
                closed: AtomicBool::new(false),
                snapshot_path: options.snapshot_path,
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.inner
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Serialize `value` as JSON and store it under `key`.
    ///
    /// A zero `ttl` means the record never expires.
    pub fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(json) => self.put_raw(key, json, ttl),
            Err(e) => error!(key, error = %e, "failed to serialize store value; dropping write"),
        }
    }

    /// Store a raw string value under `key`.
    pub fn put_raw(&self, key: &str, value: impl Into<String>, ttl: Duration) {
        if self.is_closed() {
            warn!(key, "store is closed; dropping write");
            return;
        }

        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };

        self.write().insert(
            key.to_string(),
            Entry {
                value: value.into(),
                expires_at,
            },
        );
    }

    /// Read the raw value stored under `key`, skipping expired records.
    pub fn get_raw(&self, key: &str) -> Option<Stored<String>> {
        let now = Instant::now();
        let guard = self.read();
        let entry = guard.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(Stored {
            value: entry.value.clone(),
            remaining: entry.remaining(now),
        })
    }

    /// Read and deserialize the JSON value stored under `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<Stored<T>> {
        let raw = self.get_raw(key)?;
        match serde_json::from_str(&raw.value) {
            Ok(value) => Some(Stored {
                value,
                remaining: raw.remaining,
            }),
            Err(e) => {
                error!(key, error = %e, "failed to deserialize store value");
                None
            }
        }
    }

    pub fn delete(&self, key: &str) {
        if self.write().remove(key).is_none() {
            debug!(key, "delete of absent key");
        }
    }

    /// Remove every record whose key starts with `prefix`, live or expired.
    /// Returns how many were removed.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut guard = self.write();
        let keys: Vec<String> = guard
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            guard.remove(key);
        }
        if !keys.is_empty() {
            debug!(prefix, removed = keys.len(), "deleted records by prefix");
        }
        keys.len()
    }

    /// All live `(key, value)` pairs whose key starts with `prefix`, ordered
    /// by key.
    pub fn scan_prefix_raw(&self, prefix: &str) -> Vec<(String, Stored<String>)> {
        let now = Instant::now();
        let guard = self.read();
        guard
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| {
                (
                    k.clone(),
                    Stored {
                        value: e.value.clone(),
                        remaining: e.remaining(now),
                    },
                )
            })
            .collect()
    }

    /// Typed variant of [`StateStore::scan_prefix_raw`]; undecodable records
    /// are logged and skipped.
    pub fn scan_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Vec<(String, Stored<T>)> {
        self.scan_prefix_raw(prefix)
            .into_iter()
            .filter_map(|(key, raw)| match serde_json::from_str(&raw.value) {
                Ok(value) => Some((
                    key,
                    Stored {
                        value,
                        remaining: raw.remaining,
                    },
                )),
                Err(e) => {
                    error!(key = %key, error = %e, "failed to deserialize store value");
                    None
                }
            })
            .collect()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.read().values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physically remove expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.write();
        let before = guard.len();
        guard.retain(|_, e| !e.is_expired(now));
        let removed = before - guard.len();
        if removed > 0 {
            debug!(removed, "purged expired store records");
        }
        removed
    }

    /// Spawn a background sweeper that purges expired records every `every`
    /// until the store is closed.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if store.is_closed() {
                    debug!("store closed; sweeper exiting");
                    break;
                }
                store.purge_expired();
            }
        })
    }

    /// Purge expired records and, if configured, write a snapshot of the rest.
    pub fn flush(&self) -> Result<()> {
        self.purge_expired();

        let Some(path) = self.inner.snapshot_path.as_ref() else {
            return Ok(());
        };

        let now = Instant::now();
        let records: Vec<SnapshotRecord> = self
            .read()
            .iter()
            .map(|(k, e)| SnapshotRecord {
                key: k.clone(),
                value: e.value.clone(),
                ttl_ms: e
                    .remaining(now)
                    .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            })
            .collect();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating snapshot dir {:?}", parent))?;
        }
        let json = serde_json::to_vec(&records).context("serializing store snapshot")?;
        fs::write(path, json).with_context(|| format!("writing store snapshot to {:?}", path))?;

        info!(path = ?path, records = records.len(), "flushed store snapshot");
        Ok(())
    }

    /// Flush, then reject all further writes.
    pub fn close(&self) -> Result<()> {
        let result = self.flush();
        self.inner.closed.store(true, Ordering::Release);
        info!("state store closed");
        result
    }
}
