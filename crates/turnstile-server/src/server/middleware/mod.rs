//! Call-chain middleware installed in front of every routed gRPC service.
//!
//! Each middleware is a [`tower::Layer`]. Because the set of middleware is
//! only known at runtime (an admission pool may be installed any number of
//! times), the layers are type-erased into [`HttpService`] and folded into a
//! single [`MiddlewareStack`] that tonic accepts as its server layer.
//!
//! ## Ordering
//!
//! The first middleware installed is the outermost: it sees the call first
//! and the response last.
//!
//! ## Submodules
//!
//! - [`admission`] - Routes calls through a bounded worker pool.
//! - [`trace`] - OpenTelemetry server spans per call.

pub mod admission;
pub mod trace;

pub use admission::{Admission, AdmissionLayer};
pub use trace::{TraceClient, TraceLayer};

use core::convert::Infallible;
use std::sync::Arc;
use tonic::{body::Body, service::Routes};
use tower::{Layer, ServiceExt, util::BoxCloneSyncService};
use turnstile_core::BoxError;

/// The type-erased call handler every middleware wraps.
pub type HttpService = BoxCloneSyncService<http::Request<Body>, http::Response<Body>, BoxError>;

/// A middleware that can be installed on the server's call chain.
pub trait Middleware: Send + Sync + 'static {
    /// Wraps `inner` so that every call passes through this middleware.
    fn wrap(&self, inner: HttpService) -> HttpService;
}

impl Middleware for AdmissionLayer {
    fn wrap(&self, inner: HttpService) -> HttpService {
        HttpService::new(self.layer(inner))
    }
}

impl Middleware for TraceLayer {
    fn wrap(&self, inner: HttpService) -> HttpService {
        HttpService::new(self.layer(inner))
    }
}

/// Ordered set of middleware applied to the server's routes.
#[derive(Clone, Default)]
pub struct MiddlewareStack {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `middleware` inside every middleware pushed before it.
    pub fn push(&mut self, middleware: impl Middleware) {
        self.layers.push(Arc::new(middleware));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Wraps an arbitrary handler with the whole stack.
    pub fn apply(&self, inner: HttpService) -> HttpService {
        self.layers
            .iter()
            .rev()
            .fold(inner, |service, middleware| middleware.wrap(service))
    }
}

impl core::fmt::Debug for MiddlewareStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MiddlewareStack")
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl Layer<Routes> for MiddlewareStack {
    type Service = HttpService;

    fn layer(&self, routes: Routes) -> Self::Service {
        let routes = ServiceExt::<http::Request<Body>>::map_err(routes, |never: Infallible| -> BoxError {
            match never {}
        });
        self.apply(HttpService::new(routes))
    }
}
