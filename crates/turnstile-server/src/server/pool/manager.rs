//! Bounded worker pool executing admitted [`Job`]s.
//!
//! This module defines the [`WorkerPool`] struct, which manages a fixed set of
//! asynchronous workers responsible for executing type-erased jobs (anything
//! implementing [`Execute`]). Admission is decided by a [`Semaphore`] holding
//! one permit per worker: a job is only handed over once a worker slot is
//! free, and a submitter that cannot obtain a permit within its timeout is
//! turned away with [`Error::QueueTimeout`].
//!
//! Admitted jobs travel together with their permit over a bounded
//! [`mpsc`] channel whose receiver is shared by all workers. The permit is
//! released only after the job has delivered its result, so the number of
//! admitted-but-unfinished jobs never exceeds the worker count.
//!
//! [`Job`]: turnstile_core::Job

use super::worker::{Dispatch, worker_loop};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
    time::timeout,
};
use turnstile_core::{Error, Execute, Result};

/// A fixed-capacity pool of asynchronous workers.
///
/// The pool is created unstarted, started once with a worker count, and
/// stopped once. Stopped pools reject every submission.
#[derive(Debug, Default)]
pub struct WorkerPool {
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
enum PoolState {
    #[default]
    Idle,
    Running(Running),
    Stopped,
}

#[derive(Debug)]
struct Running {
    max_workers: usize,
    permits: Arc<Semaphore>,
    sender: mpsc::Sender<Dispatch>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates an unstarted pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pool and starts it with `max_workers` workers.
    ///
    /// # Errors
    ///
    /// See [`WorkerPool::start`].
    pub fn with_workers(max_workers: usize) -> Result<Self> {
        let pool = Self::new();
        pool.start(max_workers)?;
        Ok(pool)
    }

    /// Spawns `max_workers` worker tasks on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidWorkerCount`] if `max_workers` is zero.
    /// - [`Error::PoolAlreadyStarted`] if the pool is running.
    /// - [`Error::PoolStopped`] if the pool has been stopped.
    pub fn start(&self, max_workers: usize) -> Result<()> {
        if max_workers == 0 {
            return Err(Error::InvalidWorkerCount {
                requested: max_workers,
            });
        }

        let mut state = self.state.lock();
        match *state {
            PoolState::Idle => {}
            PoolState::Running(_) => return Err(Error::PoolAlreadyStarted),
            PoolState::Stopped => return Err(Error::PoolStopped),
        }

        // At most `max_workers` permits exist, so at most that many jobs can
        // ever be buffered: a permit holder never blocks on this channel.
        let (sender, rx) = mpsc::channel(max_workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..max_workers)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, Arc::clone(&rx))))
            .collect();

        *state = PoolState::Running(Running {
            max_workers,
            permits: Arc::new(Semaphore::new(max_workers)),
            sender,
            workers,
        });

        tracing::debug!("Worker pool started with {max_workers} workers");
        Ok(())
    }

    /// Submits a job, waiting at most `wait` for a worker to become free.
    ///
    /// On success the job has been handed to the pool and will deliver
    /// exactly one result through its own channel.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueTimeout`] if no worker became available in time.
    /// - [`Error::PoolNotStarted`] / [`Error::PoolStopped`] if the pool is not
    ///   running (including when it is stopped while the submitter waits).
    pub async fn queue<J: Execute>(&self, job: J, wait: Duration) -> Result<()> {
        self.queue_boxed(Box::new(job), wait).await
    }

    /// Type-erased form of [`WorkerPool::queue`].
    pub async fn queue_boxed(&self, job: Box<dyn Execute>, wait: Duration) -> Result<()> {
        let (permits, sender) = {
            let state = self.state.lock();
            match &*state {
                PoolState::Running(running) => {
                    (Arc::clone(&running.permits), running.sender.clone())
                }
                PoolState::Idle => return Err(Error::PoolNotStarted),
                PoolState::Stopped => return Err(Error::PoolStopped),
            }
        };

        let permit = match timeout(wait, permits.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(Error::PoolStopped),
            Err(_elapsed) => {
                tracing::trace!(job = job.name(), "No worker available within {wait:?}");
                return Err(Error::QueueTimeout { timeout: wait });
            }
        };

        sender
            .send(Dispatch { job, permit })
            .await
            .map_err(|_| Error::PoolStopped)
    }

    /// Stops the pool and waits for every worker to exit.
    ///
    /// - Closes admission so waiting and future submitters fail with
    ///   [`Error::PoolStopped`].
    /// - Lets workers drain every job that was already admitted; running jobs
    ///   are not cancelled.
    /// - Waits for each worker task to finish.
    ///
    /// Stopping an idle or already stopped pool is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerLost`] for the first worker task that ended
    /// abnormally; the remaining workers are still awaited.
    pub async fn stop(&self) -> Result<()> {
        let running = {
            let mut state = self.state.lock();
            match core::mem::replace(&mut *state, PoolState::Stopped) {
                PoolState::Running(running) => running,
                PoolState::Idle | PoolState::Stopped => return Ok(()),
            }
        };

        // === Phase 1: Refuse new work ===
        tracing::debug!("Closing admission to worker pool");
        running.permits.close();
        drop(running.sender);

        // === Phase 2: Drain admitted jobs and wait for workers to exit ===
        tracing::debug!(
            "Draining {} in-flight jobs across {} workers",
            running
                .max_workers
                .saturating_sub(running.permits.available_permits()),
            running.workers.len()
        );
        let mut first_err = None;
        for (worker, handle) in running.workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                tracing::error!("Worker {worker} did not shut down cleanly: {e}");
                first_err.get_or_insert(Error::WorkerLost {
                    worker,
                    reason: e.to_string(),
                });
            }
        }

        tracing::debug!("Worker pool shutdown complete");
        first_err.map_or(Ok(()), Err)
    }

    /// Returns `true` between a successful `start` and `stop`.
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), PoolState::Running(_))
    }

    /// Configured capacity, if the pool is running.
    pub fn max_workers(&self) -> Option<usize> {
        match &*self.state.lock() {
            PoolState::Running(running) => Some(running.max_workers),
            _ => None,
        }
    }

    /// Number of admitted jobs that have not yet delivered their result.
    pub fn in_flight(&self) -> usize {
        match &*self.state.lock() {
            PoolState::Running(running) => running
                .max_workers
                .saturating_sub(running.permits.available_permits()),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Instant, sleep};
    use turnstile_core::{BoxError, CallContext, Job, JobFailure, PendingResult};

    fn sleeper(
        ms: u64,
        counter: Option<Arc<AtomicUsize>>,
    ) -> (Job<(), &'static str>, PendingResult<&'static str>) {
        Job::new("test/Sleep", CallContext::new("/test/Sleep"), (), move |_ctx, ()| async move {
            sleep(Duration::from_millis(ms)).await;
            if let Some(counter) = counter {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok::<_, BoxError>("done")
        })
    }

    #[tokio::test]
    async fn rejects_invalid_lifecycle_transitions() {
        let pool = WorkerPool::new();
        assert!(matches!(
            pool.start(0),
            Err(Error::InvalidWorkerCount { requested: 0 })
        ));

        let (job, _pending) = sleeper(0, None);
        assert!(matches!(
            pool.queue(job, Duration::from_millis(10)).await,
            Err(Error::PoolNotStarted)
        ));

        pool.start(2).unwrap();
        assert!(matches!(pool.start(2), Err(Error::PoolAlreadyStarted)));
        assert_eq!(pool.max_workers(), Some(2));

        pool.stop().await.unwrap();
        assert!(!pool.is_running());
        assert!(matches!(pool.start(2), Err(Error::PoolStopped)));

        let (job, pending) = sleeper(0, None);
        assert!(matches!(
            pool.queue(job, Duration::from_millis(10)).await,
            Err(Error::PoolStopped)
        ));
        assert!(matches!(
            pending.wait().await,
            Err(JobFailure::Worker(Error::JobAbandoned { .. }))
        ));

        // Idempotent.
        pool.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn admits_up_to_capacity_concurrently() {
        let pool = Arc::new(WorkerPool::with_workers(4).unwrap());
        let started = Instant::now();

        let mut waits = Vec::new();
        for _ in 0..4 {
            let (job, pending) = sleeper(100, None);
            pool.queue(job, Duration::from_millis(20)).await.unwrap();
            waits.push(pending);
        }
        assert_eq!(pool.in_flight(), 4);

        for pending in waits {
            assert_eq!(pending.wait().await.unwrap(), "done");
        }
        // All four ran in parallel rather than one after another.
        assert!(started.elapsed() < Duration::from_millis(350));

        pool.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn times_out_when_every_worker_is_busy() {
        let pool = WorkerPool::with_workers(1).unwrap();

        let (busy, busy_result) = sleeper(200, None);
        pool.queue(busy, Duration::from_millis(50)).await.unwrap();

        let (job, _pending) = sleeper(0, None);
        let started = Instant::now();
        let err = pool.queue(job, Duration::from_millis(50)).await.unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, Error::QueueTimeout { .. }), "{err:?}");
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(190));

        assert_eq!(busy_result.wait().await.unwrap(), "done");
        pool.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiting_submitter_gets_the_freed_slot() {
        let pool = WorkerPool::with_workers(1).unwrap();

        let (first, first_result) = sleeper(50, None);
        pool.queue(first, Duration::from_millis(10)).await.unwrap();

        let (second, second_result) = sleeper(0, None);
        pool.queue(second, Duration::from_millis(500)).await.unwrap();

        assert_eq!(first_result.wait().await.unwrap(), "done");
        assert_eq!(second_result.wait().await.unwrap(), "done");
        pool.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_drains_admitted_jobs() {
        let pool = WorkerPool::with_workers(2).unwrap();
        let completed = Arc::new(AtomicUsize::new(0));

        let mut waits = Vec::new();
        for _ in 0..2 {
            let (job, pending) = sleeper(100, Some(Arc::clone(&completed)));
            pool.queue(job, Duration::from_millis(10)).await.unwrap();
            waits.push(pending);
        }

        pool.stop().await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        for pending in waits {
            assert_eq!(pending.wait().await.unwrap(), "done");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_releases_waiting_submitters() {
        let pool = Arc::new(WorkerPool::with_workers(1).unwrap());

        let (busy, _busy_result) = sleeper(150, None);
        pool.queue(busy, Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let (job, _pending) = sleeper(0, None);
                pool.queue(job, Duration::from_secs(5)).await
            })
        };
        sleep(Duration::from_millis(20)).await;

        pool.stop().await.unwrap();
        assert!(matches!(waiter.await.unwrap(), Err(Error::PoolStopped)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_survives_a_panicking_job() {
        let pool = WorkerPool::with_workers(1).unwrap();

        let (job, pending) = Job::new("test/Panic", CallContext::new("/test/Panic"), (), |_ctx, ()| async move {
            if true {
                panic!("boom");
            }
            Ok::<(), BoxError>(())
        });
        pool.queue(job, Duration::from_millis(50)).await.unwrap();
        assert!(matches!(
            pending.wait().await,
            Err(JobFailure::Worker(Error::HandlerPanicked { .. }))
        ));

        let (job, pending) = sleeper(0, None);
        pool.queue(job, Duration::from_millis(500)).await.unwrap();
        assert_eq!(pending.wait().await.unwrap(), "done");

        pool.stop().await.unwrap();
    }
}
