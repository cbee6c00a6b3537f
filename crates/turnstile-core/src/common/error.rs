//! Error types for the admission middleware and server lifecycle.
//!
//! This module defines the central `Error` enum, which captures every
//! reportable failure of the admission path, the worker pool, and the server
//! lifecycle. It implements `From<Error>` for `tonic::Status` so call-scoped
//! failures reach clients with a status code that separates "the server is
//! overloaded" from "the request failed".
//!
//! ## Error Classes
//! - Configuration: `Config`, `InvalidState`.
//! - Startup: `Bind`, `Registration`, `Transport`.
//! - Admission: `AdmissionRejected`, wrapping one of `QueueTimeout`,
//!   `PoolNotStarted` or `PoolStopped`.
//! - Pool lifecycle: `PoolAlreadyStarted`, `InvalidWorkerCount`, `WorkerLost`.
//! - Job execution: `HandlerPanicked`, `RequestCancelled`, `JobAbandoned`.

use core::time::Duration;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Type-erased error used for handler failures passed through untouched.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for the admission middleware.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A server option or configuration value is invalid.
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// The requested operation is not valid in the server's current state.
    #[error("Invalid server state: cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },

    /// The listener could not be bound.
    #[error("[{addr}] failed to listen: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A service failed to register with the server.
    #[error("Failed to register service {service}: {reason}")]
    Registration { service: String, reason: String },

    /// The call could not be admitted to a worker.
    #[error("Admission rejected for {method}: {source}")]
    AdmissionRejected {
        method: String,
        #[source]
        source: Box<Error>,
    },

    /// No worker became available within the submission timeout.
    #[error("No worker available within {timeout:?}")]
    QueueTimeout { timeout: Duration },

    /// The pool was used before `start`.
    #[error("Worker pool is not started")]
    PoolNotStarted,

    /// `start` was called on a running pool.
    #[error("Worker pool is already started")]
    PoolAlreadyStarted,

    /// The pool has been stopped and accepts no more jobs.
    #[error("Worker pool is stopped")]
    PoolStopped,

    /// A pool must have at least one worker.
    #[error("Invalid worker count {requested}: must be greater than 0")]
    InvalidWorkerCount { requested: usize },

    /// A worker task ended abnormally.
    #[error("Worker {worker} was lost: {reason}")]
    WorkerLost { worker: usize, reason: String },

    /// The handler panicked while executing a job.
    #[error("Handler for {job} panicked: {message}")]
    HandlerPanicked { job: String, message: String },

    /// The caller went away before the job completed.
    #[error("Request cancelled by client")]
    RequestCancelled,

    /// The job was dropped without producing a result.
    #[error("Job {job} was dropped before producing a result")]
    JobAbandoned { job: String },

    /// The underlying tonic transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The background serve task ended abnormally.
    #[error("Serve task failed: {reason}")]
    ServeTask { reason: String },
}

impl Error {
    /// Returns `true` for errors that mean the server refused to admit a call
    /// rather than the call failing.
    pub const fn is_admission_rejected(&self) -> bool {
        matches!(self, Self::AdmissionRejected { .. })
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::AdmissionRejected { source, .. } => match *source {
                Error::QueueTimeout { .. } => Status::resource_exhausted(message),
                _ => Status::unavailable(message),
            },
            Error::QueueTimeout { .. } => Status::resource_exhausted(message),
            Error::PoolNotStarted | Error::PoolStopped => Status::unavailable(message),
            Error::RequestCancelled => Status::cancelled(message),
            Error::Config { .. } | Error::InvalidWorkerCount { .. } => {
                Status::failed_precondition(message)
            }
            _ => Status::internal(message),
        }
    }
}
