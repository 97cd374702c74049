//! Fixed-size pool of worker threads for CPU-bound jobs.
//!
//! Jobs beyond the number of workers wait in a shared queue. Workers take jobs
//! as they free up, so completion order follows scheduling, not submission.

use crate::error::{ServerError, ServerResult};
use crate::metrics::MetricsCollector;
use crossbeam::channel::{self, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedJob {
    job: Job,
    enqueued: Instant,
}

#[derive(Default)]
struct PoolShared {
    queued: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicUsize,
}

/// Occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub active: usize,
    pub queued: usize,
    pub completed: usize,
}

impl PoolStats {
    /// Every worker busy: new jobs will queue
    pub fn is_saturated(&self) -> bool {
        self.active >= self.size
    }
}

/// The pending result of a submitted job
pub struct JobHandle<T> {
    receiver: oneshot::Receiver<ServerResult<T>>,
}

impl<T> JobHandle<T> {
    /// Block the current thread until the job finishes.
    ///
    /// Must not be called from inside an async task; use [`JobHandle::recv`].
    pub fn wait(self) -> ServerResult<T> {
        self.receiver
            .blocking_recv()
            .map_err(|_| ServerError::Pool("worker dropped the job".to_string()))?
    }

    /// Wait for the job without blocking the async runtime
    pub async fn recv(self) -> ServerResult<T> {
        self.receiver
            .await
            .map_err(|_| ServerError::Pool("worker dropped the job".to_string()))?
    }
}

/// A fixed set of worker threads fed from one FIFO queue
pub struct WorkerPool {
    sender: Option<Sender<QueuedJob>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<PoolShared>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl WorkerPool {
    /// Spawn `size` workers
    pub fn new(size: usize) -> ServerResult<Self> {
        Self::build(size, None)
    }

    /// Spawn `size` workers that report queue wait times into `metrics`
    pub fn with_metrics(size: usize, metrics: Arc<MetricsCollector>) -> ServerResult<Self> {
        Self::build(size, Some(metrics))
    }

    fn build(size: usize, metrics: Option<Arc<MetricsCollector>>) -> ServerResult<Self> {
        if size == 0 {
            return Err(ServerError::Config(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        let (sender, receiver) = channel::unbounded::<QueuedJob>();
        let shared = Arc::new(PoolShared::default());

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = receiver.clone();
            let shared = shared.clone();
            let metrics = metrics.clone();
            let handle = thread::Builder::new()
                .name(format!("pool-worker-{}", id))
                .spawn(move || worker_loop(id, receiver, shared, metrics))?;
            workers.push(handle);
        }
        log::debug!("Started worker pool with {} workers", size);

        Ok(Self {
            sender: Some(sender),
            workers,
            shared,
            metrics,
        })
    }

    /// Queue a job; it runs as soon as a worker is free
    pub fn submit<F, T>(&self, job: F) -> ServerResult<JobHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| ServerError::Pool("pool is shut down".to_string()))?;

        let (tx, receiver) = oneshot::channel();
        let shared = self.shared.clone();
        let wrapped: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(job))
                .map_err(|_| ServerError::Pool("job panicked".to_string()));
            shared.active.fetch_sub(1, Ordering::SeqCst);
            shared.completed.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });

        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if sender
            .send(QueuedJob {
                job: wrapped,
                enqueued: Instant::now(),
            })
            .is_err()
        {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(ServerError::Pool("all workers are gone".to_string()));
        }

        let stats = self.stats();
        if stats.queued > 0 && stats.is_saturated() {
            log::debug!(
                "Worker pool saturated: {} active, {} queued",
                stats.active,
                stats.queued
            );
        }

        Ok(JobHandle { receiver })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.workers.len(),
            active: self.shared.active.load(Ordering::SeqCst),
            queued: self.shared.queued.load(Ordering::SeqCst),
            completed: self.shared.completed.load(Ordering::SeqCst),
        }
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsCollector>> {
        self.metrics.as_ref()
    }
}

fn worker_loop(
    id: usize,
    receiver: Receiver<QueuedJob>,
    shared: Arc<PoolShared>,
    metrics: Option<Arc<MetricsCollector>>,
) {
    for queued in receiver.iter() {
        shared.queued.fetch_sub(1, Ordering::SeqCst);
        shared.active.fetch_add(1, Ordering::SeqCst);
        if let Some(metrics) = &metrics {
            metrics.record_pool_wait(queued.enqueued.elapsed());
        }
        (queued.job)();
    }
    log::debug!("pool-worker-{} exiting", id);
}

impl Drop for WorkerPool {
    /// Runs what is still queued, then joins the workers
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
