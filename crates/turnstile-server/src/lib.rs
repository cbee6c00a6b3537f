//! # `turnstile-server`: Admission-Controlled gRPC Serving
//!
//! `turnstile-server` protects a [`tonic`] gRPC server from overload. Instead
//! of letting every inbound call run its handler as soon as it arrives, each
//! call is wrapped into a [`Job`](turnstile_core::Job) and handed to a
//! fixed-capacity [`WorkerPool`](server::pool::WorkerPool). A call that cannot
//! claim a worker within the configured read timeout is rejected with
//! `RESOURCE_EXHAUSTED`, so the server sheds load instead of queueing without
//! bound.
//!
//! ## Highlights
//!
//! - **Admission control**: One timeout gates entry; admitted calls run to
//!   completion on a bounded pool.
//! - **Layered pools**: Several pools can be stacked on the same call chain,
//!   each with its own capacity.
//! - **Explicit lifecycle**: Options are validated at configure time, start
//!   binds and serves in the background, stop drains every pool it created.
//! - **Tracing**: Optional OpenTelemetry server spans per call.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use turnstile_server::server::{Server, ServerConfig, ServerOption, registry};
//!
//! # async fn run() -> turnstile_server::Result<()> {
//! let mut server = Server::new(ServerConfig {
//!     port: 50051,
//!     read_timeout: Duration::from_millis(100),
//!     ..ServerConfig::default()
//! });
//! server.configure([ServerOption::WorkerPool { max_workers: 16 }])?;
//!
//! let (_reporter, health) = tonic_health::server::health_reporter();
//! server.start(vec![registry::service(health)]).await?;
//! // ... serve until shutdown ...
//! server.stop().await
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`server`] - Configuration, options, lifecycle, worker pools, middleware
//!   and telemetry.

pub mod server;

pub use turnstile_core::{CallContext, Error, Result};
