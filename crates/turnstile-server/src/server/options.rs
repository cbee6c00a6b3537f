//! Server options.
//!
//! [`ServerOption`]s are applied in order over the pending [`Settings`].
//! Applying is pure: nothing is spawned or bound until `start`, so a failed
//! option leaves the previous settings untouched. Middleware options record a
//! [`MiddlewarePlan`] that `start` materializes, in the order installed.

use super::{config::ServerConfig, middleware::TraceClient};
use turnstile_core::{Error, Result};

/// One configuration step for a [`Server`](super::Server).
#[derive(Debug, Clone)]
pub enum ServerOption {
    /// Overrides [`ServerConfig::enable_service_discovery`].
    ServiceDiscovery(bool),
    /// Sets the tracer used by later [`ServerOption::TracingMiddleware`]s.
    Tracer(TraceClient),
    /// Installs the tracing middleware. Requires a prior
    /// [`ServerOption::Tracer`].
    TracingMiddleware,
    /// Installs admission control backed by a new pool of `max_workers`
    /// workers. May be given several times; each creates its own pool.
    WorkerPool { max_workers: usize },
}

/// Middleware to build at start, in call-chain order.
#[derive(Debug, Clone)]
pub enum MiddlewarePlan {
    Tracing(TraceClient),
    Admission { max_workers: usize },
}

/// Accumulated result of every applied option.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub service_discovery: bool,
    pub tracer: Option<TraceClient>,
    pub middleware: Vec<MiddlewarePlan>,
}

impl Settings {
    /// Initial settings derived from the server configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            service_discovery: config.enable_service_discovery,
            ..Self::default()
        }
    }

    /// Applies `options` in order, stopping at the first error.
    ///
    /// # Errors
    ///
    /// The first option error, see [`ServerOption::apply`].
    pub fn apply_all(self, options: impl IntoIterator<Item = ServerOption>) -> Result<Self> {
        options
            .into_iter()
            .try_fold(self, |settings, option| option.apply(settings))
    }

    /// Number of admission pools `start` will create.
    pub fn worker_pool_count(&self) -> usize {
        self.middleware
            .iter()
            .filter(|plan| matches!(plan, MiddlewarePlan::Admission { .. }))
            .count()
    }
}

impl ServerOption {
    /// Folds this option into `settings`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for a tracing middleware without a tracer, or a
    /// worker pool with zero workers.
    pub fn apply(self, mut settings: Settings) -> Result<Settings> {
        match self {
            Self::ServiceDiscovery(enabled) => settings.service_discovery = enabled,
            Self::Tracer(client) => settings.tracer = Some(client),
            Self::TracingMiddleware => {
                let client = settings.tracer.clone().ok_or_else(|| Error::Config {
                    reason: "tracing middleware requires a tracer option first".to_string(),
                })?;
                settings.middleware.push(MiddlewarePlan::Tracing(client));
            }
            Self::WorkerPool { max_workers } => {
                if max_workers == 0 {
                    return Err(Error::Config {
                        reason: "worker pool needs at least one worker".to_string(),
                    });
                }
                settings
                    .middleware
                    .push(MiddlewarePlan::Admission { max_workers });
            }
        }
        Ok(settings)
    }
}
