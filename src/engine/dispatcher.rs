// src/engine/dispatcher.rs

//! Unbounded FIFO in front of the [`WorkerPool`].
//!
//! `push` never blocks. A single background loop pops jobs in order and
//! waits for a pool slot before spawning each one, so saturation only ever
//! holds up the loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::pool::WorkerPool;
use crate::engine::task::SubmitError;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Default)]
struct Counters {
    waiting: AtomicUsize,
}

/// Snapshot of dispatcher load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Jobs queued but not yet holding a slot.
    pub waiting: usize,
    /// Jobs currently executing.
    pub running: usize,
    pub capacity: usize,
}

#[derive(Debug)]
pub struct Dispatcher {
    /// `None` once closed. Pushes hold this lock while queueing.
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    pool: WorkerPool,
    counters: Arc<Counters>,
    loop_handle: JoinHandle<()>,
}

impl Dispatcher {
    /// Start the dispatch loop. Must be called from within a tokio runtime.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(capacity);
        let counters = Arc::new(Counters::default());
        let loop_handle = tokio::spawn(dispatch_loop(rx, pool.clone(), Arc::clone(&counters)));

        info!(capacity = pool.capacity(), "dispatcher started");
        Self {
            tx: Mutex::new(Some(tx)),
            pool,
            counters,
            loop_handle,
        }
    }

    /// Queue a job. Fails only after [`close`](Self::close).
    pub fn push<F>(&self, job: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender();
        let Some(tx) = sender.as_ref() else {
            return Err(SubmitError::Closed);
        };

        self.counters.waiting.fetch_add(1, Ordering::AcqRel);
        if tx.send(Box::pin(job)).is_err() {
            self.counters.waiting.fetch_sub(1, Ordering::AcqRel);
            self.pool.notify_changed();
            return Err(SubmitError::Closed);
        }
        Ok(())
    }

    pub fn waiting(&self) -> usize {
        self.counters.waiting.load(Ordering::Acquire)
    }

    pub fn running(&self) -> usize {
        self.pool.running()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            waiting: self.waiting(),
            running: self.running(),
            capacity: self.capacity(),
        }
    }

    pub fn resize(&self, capacity: usize) {
        self.pool.resize(capacity);
    }

    /// Stop accepting new jobs. Already queued jobs still run.
    pub fn close(&self) {
        // Dropping the sender ends the dispatch loop once the queue is empty.
        if self.sender().take().is_some() {
            info!(waiting = self.waiting(), "dispatcher closed for new jobs");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Job>>> {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until the queue is empty and no job is running.
    pub async fn drain(&self) {
        loop {
            let notified = self.pool.changed().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.waiting() == 0 && self.pool.running() == 0 {
                debug!("dispatcher drained");
                return;
            }
            notified.await;
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.loop_handle.abort();
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Job>, pool: WorkerPool, counters: Arc<Counters>) {
    while let Some(job) = rx.recv().await {
        let slot = pool.acquire().await;
        // Stop counting as waiting only once the slot is held.
        counters.waiting.fetch_sub(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let _slot = slot;
            job.await;
        });
    }
    debug!("dispatch loop exiting; job channel closed");
}
