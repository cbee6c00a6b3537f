use clap::Parser;
use tokio::signal;
use tonic_health::{ServingStatus, server::HealthReporter};
use turnstile_server::server::{
    Server, ServerOption,
    config::{CliArgs, ServerConfig},
    middleware::TraceClient,
    registry,
    telemetry::{SERVICE_NAME, init_telemetry},
};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let options = server_options(&args);
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    let result = run(config, options).await;
    providers.shutdown();
    result
}

async fn run(config: ServerConfig, options: Vec<ServerOption>) -> anyhow::Result<()> {
    let (health_reporter, health_service) = tonic_health::server::health_reporter();

    if cfg!(debug_assertions) {
        tracing::info!("Starting with full config: {config:#?}, options: {options:#?}");
    }

    let mut server = Server::new(config);
    server.configure(options)?;
    server
        .start(vec![registry::register(move |registry| {
            registry
                .add_service(health_service)?
                .register_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET);
            Ok(())
        })])
        .await?;

    shutdown_signal(&health_reporter).await;

    server.stop().await?;
    tracing::info!("Service shut down successfully");
    Ok(())
}

/// Options selected by the binary-only flags. Tracing is installed first so
/// its span covers the time a call spends waiting for admission.
fn server_options(args: &CliArgs) -> Vec<ServerOption> {
    let mut options = Vec::with_capacity(args.pools + 2);
    if args.trace {
        options.push(ServerOption::Tracer(TraceClient::new(SERVICE_NAME)));
        options.push(ServerOption::TracingMiddleware);
    }
    let max_workers = args.max_workers.unwrap_or_else(num_cpus::get);
    options.extend((0..args.pools).map(|_| ServerOption::WorkerPool { max_workers }));
    options
}

async fn shutdown_signal(health_reporter: &HealthReporter) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");

    // Publish the status before draining.
    health_reporter
        .set_service_status("", ServingStatus::NotServing)
        .await;
}
