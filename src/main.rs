use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::admission::AdmissionController;
use turnstile::clock::{Clock, SystemClock};
use turnstile::config::{StoreBackend, TurnstileConfig};
use turnstile::ratelimit::ClientKeyResolver;
use turnstile::server::GatewayServer;
use turnstile::store::{CounterStore, InMemoryStore, RedisStore};

/// How often the in-memory store drops expired keys.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on the startup connectivity probe.
const STARTUP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Distributed admission control for API gateways.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration file
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
    }

    info!("Starting Turnstile Admission Control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    let settings = config.admission_settings()?;
    info!(
        listen_addr = %config.server.listen_addr,
        algorithm = %settings.algorithm,
        limit = settings.limit,
        window = ?settings.window,
        max_concurrent = settings.max_concurrent,
        failure_policy = ?settings.failure_policy,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisStore::new(&config.store.url)?;
            match tokio::time::timeout(STARTUP_PROBE_TIMEOUT, store.ping()).await {
                Ok(Ok(())) => info!(url = %config.store.url, "Connected to counting store"),
                Ok(Err(e)) => warn!(
                    url = %config.store.url,
                    error = %e,
                    "Counting store not reachable yet; admission will follow the failure policy"
                ),
                Err(_) => warn!(
                    url = %config.store.url,
                    "Counting store did not answer PING in time; admission will follow the failure policy"
                ),
            }
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory counting store; limits are not shared between processes");
            let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
            spawn_purge_task(store.clone());
            store
        }
    };

    let controller = Arc::new(AdmissionController::from_settings(store, clock, &settings));
    info!("Admission controller initialized");

    let server = GatewayServer::new(
        config.server.listen_addr,
        controller,
        ClientKeyResolver::new(settings.trust_forwarded_headers),
    );

    // Run the server with graceful shutdown on Ctrl+C
    server
        .serve_with_shutdown(shutdown_signal())
        .await
        .context("gateway server failed")?;

    info!("Turnstile Admission Control stopped");
    Ok(())
}

fn spawn_purge_task(store: Arc<InMemoryStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
