//! Appvisor daemon
//!
//! Scans the apps directory, registers the declared services, starts the
//! auto-start ones and supervises them until Ctrl-C or SIGTERM.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use appvisor_server::infra::docker::{ContainerRuntime, DockerManager};
use appvisor_server::infra::sqlite::ServiceStateRepository;
use appvisor_server::service::orchestrator::Orchestrator;
use appvisor_server::{Config, Supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("Starting Appvisor");
    info!("Apps directory: {}", config.apps_dir.display());

    // Initialize infrastructure
    let pool = ServiceStateRepository::init(&config.database_url).await?;
    let repository = ServiceStateRepository::new(pool);

    let containers = detect_container_runtime(&config).await;
    let orchestrator = Orchestrator::detect(&config).await;

    let supervisor = Supervisor::build(config, Some(repository), containers, orchestrator).await;

    let started = supervisor.services().start_auto().await;
    info!(count = started.len(), "Auto-start services running");

    shutdown_signal().await;

    info!("Shutting down, stopping services");
    supervisor.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Docker runtime if the daemon answers, otherwise none
async fn detect_container_runtime(config: &Config) -> Option<Arc<dyn ContainerRuntime>> {
    let docker = match DockerManager::new(config.docker_socket.as_deref(), &config.sandbox_image) {
        Ok(docker) => docker,
        Err(e) => {
            warn!("Docker client unavailable: {}", e);
            return None;
        }
    };
    match docker.ping().await {
        Ok(()) => {
            info!("Docker runtime detected");
            Some(Arc::new(docker))
        }
        Err(e) => {
            warn!("Docker not reachable, container isolation disabled: {}", e);
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
