use anyhow::bail;
use clap::{Args, Command, FromArgMatches, Parser, builder::BoolishValueParser};
use core::time::Duration;

/// Default listen host.
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// Default listen port.
pub const DEFAULT_PORT: u16 = 10000;
/// Default submission timeout, in milliseconds.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 500;

/// Runtime configuration for the `turnstile-server` binary.
///
/// Every value can be given as a CLI flag or through its environment
/// variable. The server-level settings map onto [`ServerConfig`]; the
/// remaining flags decide which options the binary installs.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "turnstile-server",
    version,
    about = "A gRPC server that admits calls through bounded worker pools"
)]
pub struct CliArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    /// Workers per admission pool. Defaults to the number of CPUs.
    ///
    /// Environment variable: `GRPC_SERVER_MAX_WORKERS`
    #[arg(long, env = "GRPC_SERVER_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Number of admission pools stacked on the call chain. 0 disables
    /// admission control.
    ///
    /// Environment variable: `GRPC_SERVER_POOLS`
    #[arg(long, env = "GRPC_SERVER_POOLS", default_value_t = 1)]
    pub pools: usize,

    /// Open an OpenTelemetry server span for every call.
    ///
    /// Environment variable: `GRPC_SERVER_TRACE`
    #[arg(
        long,
        env = "GRPC_SERVER_TRACE",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub trace: bool,
}

/// The settings that make up a [`ServerConfig`].
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Host or IP address to listen on.
    ///
    /// Environment variable: `GRPC_SERVER_HOST`
    #[arg(long, env = "GRPC_SERVER_HOST", default_value_t = String::from(DEFAULT_HOST))]
    pub host: String,

    /// TCP port to listen on. Use 0 for an ephemeral port.
    ///
    /// Environment variable: `GRPC_SERVER_PORT`
    #[arg(long, env = "GRPC_SERVER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Register the gRPC reflection service so tools such as `grpcurl` can
    /// discover the served APIs.
    ///
    /// Environment variable: `GRPC_SERVER_SERVICE_DISCOVERY`
    #[arg(
        long,
        env = "GRPC_SERVER_SERVICE_DISCOVERY",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub service_discovery: bool,

    /// How long a call may wait for a free worker before it is rejected, in
    /// milliseconds.
    ///
    /// Environment variable: `GRPC_SERVER_READ_TIMEOUT`
    #[arg(long = "read-timeout-ms", env = "GRPC_SERVER_READ_TIMEOUT", default_value_t = DEFAULT_READ_TIMEOUT_MS)]
    pub read_timeout_ms: u64,
}

/// Server-level configuration. Immutable once the server has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_service_discovery: bool,
    /// Submission timeout applied by every admission pool.
    pub read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            enable_service_discovery: false,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }
}

impl ServerConfig {
    /// Builds the configuration from the `GRPC_SERVER_*` environment
    /// variables, falling back to the defaults.
    ///
    /// # Errors
    ///
    /// Fails if a variable cannot be parsed or a value is invalid. Only the
    /// server-level keys are read.
    pub fn from_env() -> anyhow::Result<Self> {
        let name = env!("CARGO_PKG_NAME");
        let matches = ServerArgs::augment_args(Command::new(name)).try_get_matches_from([name])?;
        Self::try_from(ServerArgs::from_arg_matches(&matches)?)
    }

    /// `host:port` as passed to the listener.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        Self::try_from(args.server)
    }
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let host = args.host.trim();
        if host.is_empty() {
            bail!("GRPC_SERVER_HOST must not be empty");
        }
        if host.contains(char::is_whitespace) {
            bail!("GRPC_SERVER_HOST ({host:?}) must not contain whitespace");
        }

        Ok(Self {
            host: host.to_string(),
            port: args.port,
            enable_service_discovery: args.service_discovery,
            read_timeout: Duration::from_millis(args.read_timeout_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = std::iter::once("turnstile-server").chain(args.iter().copied());
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 10000);
        assert!(!config.enable_service_discovery);
        assert_eq!(config.read_timeout, Duration::from_millis(500));
        assert_eq!(config.addr(), "0.0.0.0:10000");
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--host",
            "127.0.0.1",
            "--port",
            "50051",
            "--service-discovery",
            "true",
            "--read-timeout-ms",
            "50",
        ])
        .unwrap();
        assert_eq!(config.addr(), "127.0.0.1:50051");
        assert!(config.enable_service_discovery);
        assert_eq!(config.read_timeout, Duration::from_millis(50));
    }

    #[test]
    fn binary_flags_are_parsed() {
        let args = CliArgs::try_parse_from([
            "turnstile-server",
            "--max-workers",
            "8",
            "--pools",
            "2",
            "--trace",
            "true",
        ])
        .unwrap();
        assert_eq!(args.max_workers, Some(8));
        assert_eq!(args.pools, 2);
        assert!(args.trace);
        assert_eq!(args.server.port, DEFAULT_PORT);
    }

    #[test]
    fn switches_accept_common_truthy_spellings() {
        for value in ["1", "yes", "on", "true"] {
            let config = parse(&["--service-discovery", value]).unwrap();
            assert!(config.enable_service_discovery, "{value}");
        }
        for value in ["0", "no", "off", "false"] {
            let config = parse(&["--service-discovery", value]).unwrap();
            assert!(!config.enable_service_discovery, "{value}");
        }
        let args = CliArgs::try_parse_from(["turnstile-server", "--trace", "1"]).unwrap();
        assert!(args.trace);
        assert!(parse(&["--service-discovery", "maybe"]).is_err());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(parse(&["--host", "  "]).is_err());
        assert!(parse(&["--host", "local host"]).is_err());
        assert!(parse(&["--port", "70000"]).is_err());
        assert!(parse(&["--read-timeout-ms", "-1"]).is_err());
    }
}
