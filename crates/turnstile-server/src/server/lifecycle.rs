//! Server lifecycle: configure, start, stop.
//!
//! A [`Server`] moves through three states:
//!
//! ```text
//! Configured --start--> Started --stop--> Stopped
//!     ^  |
//!     +--+ configure / failed start / stop
//! ```
//!
//! Start performs, in order:
//!
//! - Builds the middleware stack, spawning one [`WorkerPool`] per admission
//!   option.
//! - Runs the registration callbacks and, with service discovery enabled,
//!   registers the reflection service.
//! - Binds the listener and spawns the serve task, returning once the task
//!   is running.
//!
//! If any of these fail, the pools spawned for this attempt are stopped and
//! the server stays `Configured`.

use super::{
    config::ServerConfig,
    middleware::{AdmissionLayer, MiddlewareStack},
    options::{MiddlewarePlan, ServerOption, Settings},
    pool::WorkerPool,
    registry::{RegisterService, ServiceRegistry},
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use turnstile_core::{Error, Result};

/// An admission-controlled gRPC server.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    settings: Settings,
    state: Lifecycle,
    worker_pools: Vec<Arc<WorkerPool>>,
}

#[derive(Debug)]
enum Lifecycle {
    Configured,
    Started(Running),
    Stopped,
}

#[derive(Debug)]
struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<core::result::Result<(), tonic::transport::Error>>,
}

impl Lifecycle {
    const fn name(&self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::Started(_) => "started",
            Self::Stopped => "stopped",
        }
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let settings = Settings::from_config(&config);
        Self {
            config,
            settings,
            state: Lifecycle::Configured,
            worker_pools: Vec::new(),
        }
    }

    /// Creates a server from the `GRPC_SERVER_*` environment variables.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the environment holds an invalid value.
    pub fn from_env() -> Result<Self> {
        let config = ServerConfig::from_env().map_err(|e| Error::Config {
            reason: format!("{e:#}"),
        })?;
        Ok(Self::new(config))
    }

    /// Applies `options` in order on top of the options applied so far.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] once the server has started.
    /// - The first failing option's error; no option of this call is kept.
    pub fn configure(&mut self, options: impl IntoIterator<Item = ServerOption>) -> Result<()> {
        self.ensure_configured("configure")?;
        self.settings = self.settings.clone().apply_all(options)?;
        Ok(())
    }

    /// Registers `services`, binds the listener and starts serving in a
    /// background task.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if already started or stopped.
    /// - [`Error::Registration`] if a callback fails or a service name
    ///   repeats.
    /// - [`Error::Bind`] if the address cannot be bound.
    pub async fn start(&mut self, services: Vec<RegisterService>) -> Result<()> {
        self.ensure_configured("start")?;

        let (stack, pools) = self.build_middleware().await?;
        let result = self.serve(stack, services).await;
        self.worker_pools = pools;

        match result {
            Ok(running) => {
                tracing::info!(
                    host = %self.config.host,
                    port = running.local_addr.port(),
                    service_discovery = self.settings.service_discovery,
                    "Started gRPC server at {}:{}, service discovery enabled: {}",
                    self.config.host,
                    running.local_addr.port(),
                    self.settings.service_discovery,
                );
                self.state = Lifecycle::Started(running);
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Start failed, stopping {} pools: {e}", self.worker_pools.len());
                // The start error is what the caller sees.
                if let Err(stop_err) = stop_pools(&self.worker_pools).await {
                    tracing::warn!("Failed to stop worker pools after failed start: {stop_err}");
                }
                Err(e)
            }
        }
    }

    /// Stops serving and stops every worker pool this server created.
    ///
    /// In-flight calls are drained before the serve task exits. Every step
    /// runs even if an earlier one fails; the first error is returned.
    /// Stopping a server that never started, or stopping twice, is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] or [`Error::ServeTask`] if the serve task failed,
    /// or a pool's stop error.
    pub async fn stop(&mut self) -> Result<()> {
        let running = match core::mem::replace(&mut self.state, Lifecycle::Stopped) {
            Lifecycle::Started(running) => running,
            Lifecycle::Configured => {
                self.state = Lifecycle::Configured;
                return Ok(());
            }
            Lifecycle::Stopped => return Ok(()),
        };

        running.shutdown.cancel();
        let mut first_err = match running.task.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(Error::Transport(e)),
            Err(e) => Some(Error::ServeTask {
                reason: e.to_string(),
            }),
        };

        if let Err(e) = stop_pools(&self.worker_pools).await {
            first_err.get_or_insert(e);
        }

        tracing::debug!("Server stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Address the listener is bound to, while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            Lifecycle::Started(running) => Some(running.local_addr),
            _ => None,
        }
    }

    pub fn is_serving(&self) -> bool {
        matches!(self.state, Lifecycle::Started(_))
    }

    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Pools created by the latest start attempt, in installation order.
    pub fn worker_pools(&self) -> &[Arc<WorkerPool>] {
        &self.worker_pools
    }

    fn ensure_configured(&self, action: &'static str) -> Result<()> {
        match self.state {
            Lifecycle::Configured => Ok(()),
            ref state => Err(Error::InvalidState {
                action,
                state: state.name(),
            }),
        }
    }

    async fn build_middleware(&self) -> Result<(MiddlewareStack, Vec<Arc<WorkerPool>>)> {
        let mut stack = MiddlewareStack::new();
        let mut pools = Vec::with_capacity(self.settings.worker_pool_count());

        for plan in &self.settings.middleware {
            match plan {
                MiddlewarePlan::Tracing(client) => stack.push(client.layer()),
                MiddlewarePlan::Admission { max_workers } => {
                    match AdmissionLayer::spawn(*max_workers, self.config.read_timeout) {
                        Ok(layer) => {
                            pools.push(Arc::clone(layer.pool()));
                            stack.push(layer);
                        }
                        Err(e) => {
                            if let Err(stop_err) = stop_pools(&pools).await {
                                tracing::warn!(
                                    "Failed to stop worker pools after failed spawn: {stop_err}"
                                );
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }

        Ok((stack, pools))
    }

    async fn serve(&self, stack: MiddlewareStack, services: Vec<RegisterService>) -> Result<Running> {
        let mut registry = ServiceRegistry::new();
        registry.run(services)?;
        if self.settings.service_discovery {
            registry.add_reflection()?;
        }
        let routes = registry.into_routes();

        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr).await.map_err(|source| Error::Bind {
            addr: addr.clone(),
            source,
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();
        let router = tonic::transport::Server::builder()
            .layer(stack)
            .add_routes(routes);

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = ready_tx.send(());
            let result = router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
                .await;
            if let Err(e) = &result {
                tracing::error!("Failed to serve: {e}");
            }
            result
        });

        if ready_rx.await.is_err() {
            return Err(Error::ServeTask {
                reason: "serve task exited before it started".to_string(),
            });
        }

        Ok(Running {
            local_addr,
            shutdown,
            task,
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Lifecycle::Started(running) = &self.state {
            running.shutdown.cancel();
        }
    }
}

async fn stop_pools(pools: &[Arc<WorkerPool>]) -> Result<()> {
    let mut first_err = None;
    for pool in pools {
        if let Err(e) = pool.stop().await {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    fn local() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            read_timeout: Duration::from_millis(50),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let mut server = Server::new(local());
        server.stop().await.unwrap();
        assert!(!server.is_serving());

        // Still configurable and startable afterwards.
        server
            .configure([ServerOption::WorkerPool { max_workers: 1 }])
            .unwrap();
        server.start(Vec::new()).await.unwrap();
        assert!(server.is_serving());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_configure_keeps_previous_settings() {
        let mut server = Server::new(local());
        server
            .configure([ServerOption::WorkerPool { max_workers: 2 }])
            .unwrap();

        let err = server
            .configure([
                ServerOption::WorkerPool { max_workers: 3 },
                ServerOption::TracingMiddleware,
            ])
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }), "{err:?}");
        assert_eq!(server.settings().worker_pool_count(), 1);
    }

    #[tokio::test]
    async fn lifecycle_is_one_way() {
        let mut server = Server::new(local());
        server.start(Vec::new()).await.unwrap();
        assert!(server.local_addr().is_some_and(|addr| addr.port() != 0));

        assert!(matches!(
            server.configure([ServerOption::ServiceDiscovery(true)]),
            Err(Error::InvalidState { action: "configure", state: "started" })
        ));
        assert!(matches!(
            server.start(Vec::new()).await,
            Err(Error::InvalidState { action: "start", state: "started" })
        ));

        server.stop().await.unwrap();
        server.stop().await.unwrap();
        assert!(server.local_addr().is_none());
        assert!(matches!(
            server.start(Vec::new()).await,
            Err(Error::InvalidState { action: "start", state: "stopped" })
        ));
    }

    #[tokio::test]
    async fn stop_stops_every_pool() {
        let mut server = Server::new(local());
        server
            .configure([
                ServerOption::WorkerPool { max_workers: 2 },
                ServerOption::WorkerPool { max_workers: 1 },
                ServerOption::WorkerPool { max_workers: 3 },
            ])
            .unwrap();
        server.start(Vec::new()).await.unwrap();

        let capacities: Vec<_> = server
            .worker_pools()
            .iter()
            .map(|pool| pool.max_workers())
            .collect();
        assert_eq!(capacities, vec![Some(2), Some(1), Some(3)]);

        server.stop().await.unwrap();
        assert!(server.worker_pools().iter().all(|pool| !pool.is_running()));
    }
}
