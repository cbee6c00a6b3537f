//! Server-side components of the admission-controlled gRPC server.
//!
//! ## Submodules
//!
//! - [`config`] - Environment/CLI driven [`ServerConfig`].
//! - [`options`] - Ordered, fail-fast [`ServerOption`]s folded into
//!   [`Settings`](options::Settings).
//! - [`lifecycle`] - The [`Server`] state machine: configure, start, stop.
//! - [`registry`] - Service registration callbacks.
//! - [`pool`] - The bounded [`WorkerPool`](pool::WorkerPool).
//! - [`middleware`] - Admission and tracing layers installed on every call.
//! - [`telemetry`] - Logging, tracing and metrics initialization.

pub mod config;
pub mod lifecycle;
pub mod middleware;
pub mod options;
pub mod pool;
pub mod registry;
pub mod telemetry;

pub use config::ServerConfig;
pub use lifecycle::Server;
pub use options::ServerOption;
