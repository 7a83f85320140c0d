// src/engine/pool.rs

//! Resizable bounded execution pool.
//!
//! The pool only counts slots; callers acquire a [`Slot`] and hold it for as
//! long as their work runs. Shrinking never interrupts work that already holds
//! a slot: new acquisitions simply wait until `running < capacity` again.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug)]
struct Slots {
    capacity: usize,
    running: usize,
}

#[derive(Debug)]
struct PoolInner {
    slots: Mutex<Slots>,
    changed: Notify,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Counting pool with runtime-adjustable capacity.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(Slots {
                    capacity: capacity.max(1),
                    running: 0,
                }),
                changed: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    /// Change the capacity. In-flight work keeps its slots.
    pub fn resize(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let previous = {
            let mut slots = self.inner.lock();
            std::mem::replace(&mut slots.capacity, capacity)
        };
        info!(from = previous, to = capacity, "worker pool resized");
        self.inner.changed.notify_waiters();
    }

    /// Take a slot without waiting.
    pub fn try_acquire(&self) -> Option<Slot> {
        let mut slots = self.inner.lock();
        if slots.running < slots.capacity {
            slots.running += 1;
            Some(Slot {
                pool: Arc::clone(&self.inner),
            })
        } else {
            None
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Slot {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(slot) = self.try_acquire() {
                return slot;
            }
            debug!("worker pool saturated; waiting for a free slot");
            notified.await;
        }
    }

    /// Wait until no slot is held.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.running() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn notify_changed(&self) {
        self.inner.changed.notify_waiters();
    }

    pub(crate) fn changed(&self) -> &Notify {
        &self.inner.changed
    }
}

/// A held pool slot; released on drop, including when the holder panics.
#[derive(Debug)]
pub struct Slot {
    pool: Arc<PoolInner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        {
            let mut slots = self.pool.lock();
            slots.running = slots.running.saturating_sub(1);
        }
        self.pool.changed.notify_waiters();
    }
}
