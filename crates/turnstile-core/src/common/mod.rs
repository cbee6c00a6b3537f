//! Contracts shared between the admission middleware and the worker pool.
//!
//! - [`error`] - The unified [`Error`] type and its gRPC status mapping.
//! - [`context`] - Per-call [`CallContext`] with deadline and cancellation.
//! - [`job`] - The [`Job`] unit of work and its single-shot result channel.

pub mod context;
pub mod error;
pub mod job;

pub use context::CallContext;
pub use error::{BoxError, Error, Result};
pub use job::{Execute, Handler, Job, JobFailure, JobResult, PendingResult};
