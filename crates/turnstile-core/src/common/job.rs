//! The unit of work handed from the admission path to a worker pool.
//!
//! A [`Job`] bundles a call's [`CallContext`], its request, the handler that
//! produces the response, and the sending half of a `oneshot` channel. The
//! receiving half is returned to the caller as a [`PendingResult`].
//!
//! ## Guarantees
//!
//! - A job is consumed when executed, so it can run at most once.
//! - The result channel is written at most once, by the executing worker.
//! - A handler panic is caught and reported as
//!   [`Error::HandlerPanicked`], so execution always ends with a result.
//! - A job dropped without executing closes the channel, which
//!   [`PendingResult::wait`] reports as [`Error::JobAbandoned`]. The waiting
//!   side can therefore never block forever on a job that is gone.

use crate::{BoxError, CallContext, Error};
use core::{future::Future, panic::AssertUnwindSafe};
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use tokio::sync::oneshot;

/// Handler invoked by the worker with the call's context and request.
pub type Handler<Req, Resp> =
    Box<dyn FnOnce(CallContext, Req) -> BoxFuture<'static, Result<Resp, BoxError>> + Send>;

/// Outcome of a job: the handler's response or a failure, never both.
pub type JobResult<Resp> = Result<Resp, JobFailure>;

/// Why a job did not produce a response.
#[derive(thiserror::Error, Debug)]
pub enum JobFailure {
    /// The handler itself failed; passed through to the caller unchanged.
    #[error("{0}")]
    Handler(BoxError),

    /// The execution machinery failed (panic, cancellation, abandonment).
    #[error(transparent)]
    Worker(#[from] Error),
}

/// Type-erased job execution, so a pool can run jobs of any request and
/// response type.
pub trait Execute: Send + 'static {
    /// Diagnostic name of the job.
    fn name(&self) -> &str;

    /// Runs the job to completion and delivers its result.
    fn execute(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// A single admitted call waiting to be executed by a worker.
pub struct Job<Req, Resp> {
    name: String,
    context: CallContext,
    request: Req,
    handler: Handler<Req, Resp>,
    result: oneshot::Sender<JobResult<Resp>>,
}

impl<Req, Resp> Job<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Creates a job together with the handle its caller waits on.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        context: CallContext,
        request: Req,
        handler: F,
    ) -> (Self, PendingResult<Resp>)
    where
        F: FnOnce(CallContext, Req) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Resp, BoxError>> + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = oneshot::channel();
        let pending = PendingResult {
            job: name.clone(),
            rx,
        };
        let job = Self {
            name,
            context,
            request,
            handler: Box::new(move |ctx, req| handler(ctx, req).boxed()),
            result: tx,
        };
        (job, pending)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn context(&self) -> &CallContext {
        &self.context
    }

    /// Executes the handler and writes its outcome to the result channel.
    ///
    /// The handler is skipped entirely when the caller has already gone
    /// away, and dropped mid-flight if the call is cancelled while it runs.
    pub async fn run(self) {
        let Self {
            name,
            context,
            request,
            handler,
            result,
        } = self;

        if result.is_closed() || context.is_cancelled() {
            tracing::debug!(job = %name, "Skipping job abandoned by its caller");
            return;
        }

        let handler_ctx = context.clone();
        let work = AssertUnwindSafe(async move { handler(handler_ctx, request).await }).catch_unwind();

        let outcome = tokio::select! {
            biased;
            res = work => match res {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(e)) => Err(JobFailure::Handler(e)),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(job = %name, "Handler panicked: {message}");
                    Err(JobFailure::Worker(Error::HandlerPanicked {
                        job: name.clone(),
                        message,
                    }))
                }
            },
            () = context.cancelled() => {
                tracing::debug!(job = %name, "Job cancelled by its caller");
                Err(JobFailure::Worker(Error::RequestCancelled))
            }
        };

        if result.send(outcome).is_err() {
            tracing::debug!(job = %name, "Caller dropped before the result was delivered");
        }
    }
}

impl<Req, Resp> Execute for Job<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(self: Box<Self>) -> BoxFuture<'static, ()> {
        (*self).run().boxed()
    }
}

impl<Req, Resp> core::fmt::Debug for Job<Req, Resp> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Receiving side of a job's result channel.
#[derive(Debug)]
pub struct PendingResult<Resp> {
    job: String,
    rx: oneshot::Receiver<JobResult<Resp>>,
}

impl<Resp> PendingResult<Resp> {
    /// Waits for the job's single result.
    ///
    /// There is no timeout here: once admitted, a call waits for its job to
    /// actually finish.
    pub async fn wait(self) -> JobResult<Resp> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(JobFailure::Worker(Error::JobAbandoned { job: self.job })),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
