//! Service registration.
//!
//! The server does not know the gRPC services it serves. Callers hand
//! [`Server::start`](super::Server::start) a list of [`RegisterService`]
//! callbacks; each one receives the [`ServiceRegistry`] and adds its services
//! (and optionally their encoded file descriptor sets, used by reflection).
//! Callbacks run in order, before the listener is bound.

use core::convert::Infallible;
use std::collections::BTreeSet;
use tonic::{
    body::Body,
    server::NamedService,
    service::{Routes, RoutesBuilder},
};
use tower::Service;
use turnstile_core::{Error, Result};

/// Registration callback run once during `start`.
pub type RegisterService = Box<dyn FnOnce(&mut ServiceRegistry) -> anyhow::Result<()> + Send>;

/// Wraps a closure into a [`RegisterService`].
pub fn register<F>(f: F) -> RegisterService
where
    F: FnOnce(&mut ServiceRegistry) -> anyhow::Result<()> + Send + 'static,
{
    Box::new(f)
}

/// Registration callback adding a single generated tonic service.
pub fn service<S>(svc: S) -> RegisterService
where
    S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
        + NamedService
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    register(move |registry| {
        registry.add_service(svc)?;
        Ok(())
    })
}

/// Collects the services served by one server instance.
#[derive(Default)]
pub struct ServiceRegistry {
    routes: RoutesBuilder,
    names: BTreeSet<&'static str>,
    descriptors: Vec<&'static [u8]>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes calls for `S::NAME` to `svc`.
    ///
    /// # Errors
    ///
    /// [`Error::Registration`] if a service with the same name is already
    /// registered.
    pub fn add_service<S>(&mut self, svc: S) -> Result<&mut Self>
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        if !self.names.insert(S::NAME) {
            return Err(Error::Registration {
                service: S::NAME.to_string(),
                reason: "already registered".to_string(),
            });
        }
        tracing::debug!(service = S::NAME, "Registered service");
        self.routes.add_service(svc);
        Ok(self)
    }

    /// Adds an encoded `FileDescriptorSet` for the reflection service.
    pub fn register_file_descriptor_set(&mut self, encoded: &'static [u8]) -> &mut Self {
        self.descriptors.push(encoded);
        self
    }

    /// Fully qualified names of the registered services, sorted.
    pub fn service_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.names.iter().copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn file_descriptor_sets(&self) -> &[&'static [u8]] {
        &self.descriptors
    }

    /// Runs `callbacks` in order against this registry.
    ///
    /// # Errors
    ///
    /// The first failing callback is reported as [`Error::Registration`].
    pub fn run(&mut self, callbacks: Vec<RegisterService>) -> Result<()> {
        for (index, callback) in callbacks.into_iter().enumerate() {
            callback(self).map_err(|e| match e.downcast::<Error>() {
                Ok(err @ Error::Registration { .. }) => err,
                Ok(other) => Error::Registration {
                    service: format!("callback #{index}"),
                    reason: other.to_string(),
                },
                Err(e) => Error::Registration {
                    service: format!("callback #{index}"),
                    reason: format!("{e:#}"),
                },
            })?;
        }
        Ok(())
    }

    /// Adds the gRPC reflection service describing every registered
    /// descriptor set.
    ///
    /// # Errors
    ///
    /// [`Error::Registration`] if a descriptor set cannot be decoded.
    pub fn add_reflection(&mut self) -> Result<&mut Self> {
        let reflection = self
            .descriptors
            .iter()
            .copied()
            .fold(
                tonic_reflection::server::Builder::configure(),
                |builder, encoded| builder.register_encoded_file_descriptor_set(encoded),
            )
            .build_v1()
            .map_err(|e| Error::Registration {
                service: "grpc.reflection.v1.ServerReflection".to_string(),
                reason: e.to_string(),
            })?;
        self.add_service(reflection)
    }

    /// Finishes registration, returning the routing table.
    pub fn into_routes(self) -> Routes {
        self.routes.routes()
    }
}

impl core::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names)
            .field("descriptor_sets", &self.descriptors.len())
            .finish_non_exhaustive()
    }
}
