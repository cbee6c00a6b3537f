//! Admission control: every call must claim a worker before it runs.
//!
//! [`AdmissionLayer`] wraps a service so that each inbound call becomes a
//! [`Job`] queued into a shared [`WorkerPool`]. The call waits at most the
//! layer's timeout for a free worker; if none frees up it is rejected with an
//! [`Error::AdmissionRejected`] status and the wrapped handler never runs.
//! Once admitted, the call waits for its job to finish with no further
//! timeout.
//!
//! Rejections are answered as gRPC status responses
//! (`RESOURCE_EXHAUSTED` for a queue timeout, `UNAVAILABLE` for a stopped
//! pool) so the connection stays healthy and clients can tell overload apart
//! from a failed request. Handler errors are passed through untouched.
//!
//! If the call is dropped while waiting (for example the client went away),
//! the call's [`CallContext`] is cancelled, which drops the job's handler if
//! it is already running. The layer's in-flight count and the job metrics
//! are settled by a guard, so an abandoned call is accounted for as well.

use crate::server::{pool::WorkerPool, telemetry};
use core::{
    task::{Context, Poll},
    time::Duration,
};
use futures::future::BoxFuture;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::time::Instant;
use tonic::Status;
use tower::{Layer, Service, ServiceExt};
use turnstile_core::{BoxError, CallContext, Error, Job, JobFailure, Result};

/// Layer that routes calls through a bounded [`WorkerPool`].
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    pool: Arc<WorkerPool>,
    timeout: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl AdmissionLayer {
    /// Routes calls through an existing pool, waiting at most `timeout` for a
    /// free worker.
    pub fn new(pool: Arc<WorkerPool>, timeout: Duration) -> Self {
        Self {
            pool,
            timeout,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates and starts a dedicated pool with `max_workers` workers.
    ///
    /// # Errors
    ///
    /// Returns the pool's start error, e.g. [`Error::InvalidWorkerCount`].
    pub fn spawn(max_workers: usize, timeout: Duration) -> Result<Self> {
        let pool = WorkerPool::with_workers(max_workers)?;
        Ok(Self::new(Arc::new(pool), timeout))
    }

    /// The pool backing this layer; its owner is responsible for stopping it.
    pub const fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Admitted calls whose caller is still waiting for the result.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = Admission<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Admission {
            inner,
            pool: Arc::clone(&self.pool),
            timeout: self.timeout,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

/// Held while an admitted call waits for its job. Dropping it, on completion
/// or because the caller went away, closes the in-flight record.
struct InFlight {
    count: Arc<AtomicUsize>,
    started: Instant,
}

impl InFlight {
    fn enter(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        telemetry::increment_admitted();
        telemetry::increment_jobs_inflight();
        Self {
            count,
            started: Instant::now(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
        telemetry::decrement_jobs_inflight();
        telemetry::record_job_duration(self.started.elapsed().as_secs_f64() * 1000.0);
    }
}

/// Service produced by [`AdmissionLayer`].
#[derive(Clone, Debug)]
pub struct Admission<S> {
    inner: S,
    pool: Arc<WorkerPool>,
    timeout: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl<S, B, ResBody> Service<http::Request<B>> for Admission<S>
where
    S: Service<http::Request<B>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    B: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = http::Response<ResBody>;
    type Error = BoxError;
    type Future = BoxFuture<'static, core::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<core::result::Result<(), Self::Error>> {
        // Readiness of the inner service is driven by the worker through
        // `oneshot`; capacity is decided by the pool at call time.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: http::Request<B>) -> Self::Future {
        let method = req.uri().path().to_owned();
        let context = CallContext::from_headers(method.as_str(), req.headers());
        req.extensions_mut().insert(context.clone());

        let inner = self.inner.clone();
        let (job, pending) = Job::new(
            format!("admission{method}"),
            context.clone(),
            req,
            move |_ctx, req| async move { inner.oneshot(req).await.map_err(Into::into) },
        );

        let pool = Arc::clone(&self.pool);
        let timeout = self.timeout;
        let in_flight = Arc::clone(&self.in_flight);

        Box::pin(async move {
            // Cancels the job if this future is dropped before it resolves.
            let cancel_on_drop = context.cancellation().clone().drop_guard();

            if let Err(source) = pool.queue(job, timeout).await {
                let _ = cancel_on_drop.disarm();
                telemetry::increment_rejected();
                let err = Error::AdmissionRejected {
                    method,
                    source: Box::new(source),
                };
                tracing::warn!("{err}");
                return Ok(Status::from(err).into_http());
            }

            let guard = InFlight::enter(in_flight);
            let started = guard.started;
            let outcome = pending.wait().await;
            let _ = cancel_on_drop.disarm();
            drop(guard);

            match outcome {
                Ok(resp) => {
                    tracing::debug!(
                        method = %method,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Call completed"
                    );
                    Ok(resp)
                }
                Err(JobFailure::Handler(e)) => {
                    tracing::debug!(method = %method, "Handler failed: {e}");
                    Err(e)
                }
                Err(JobFailure::Worker(e)) => {
                    tracing::warn!(method = %method, "Job failed: {e}");
                    Ok(Status::from(e).into_http())
                }
            }
        })
    }
}
