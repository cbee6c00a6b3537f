use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, mpsc};
use turnstile_core::Execute;

/// An admitted job together with the worker slot reserved for it.
pub struct Dispatch {
    pub job: Box<dyn Execute>,
    pub permit: OwnedSemaphorePermit,
}

/// Worker task responsible for executing admitted jobs.
///
/// All workers of a pool share one receiver; whichever worker is idle takes
/// the next [`Dispatch`]. The slot permit is held until the job has delivered
/// its result, then released so the pool can admit another job.
///
/// The loop ends once the pool drops its sender and the channel has been
/// drained, which is how [`WorkerPool::stop`] lets in-flight work finish.
///
/// [`WorkerPool::stop`]: super::WorkerPool::stop
pub async fn worker_loop(worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<Dispatch>>>) {
    tracing::trace!("Worker {worker_id} started");

    loop {
        // Only one idle worker waits on the channel at a time; the lock is
        // released before the job runs.
        let next = rx.lock().await.recv().await;
        let Some(Dispatch { job, permit }) = next else {
            break;
        };

        tracing::trace!("Worker {worker_id} executing {}", job.name());
        job.execute().await;
        drop(permit);
    }

    tracing::trace!("Worker {worker_id} stopped");
}
