//! Fixed-capacity execution pool for admitted jobs.
//!
//! - [`manager`] - [`WorkerPool`]: lifecycle, admission with timeout, drain.
//! - [`worker`] - The loop run by each worker task.

pub mod manager;
pub mod worker;

pub use manager::WorkerPool;
