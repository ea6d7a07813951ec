//! Proxy node binary
//!
//! Loads the node file, seeds the admission guard, starts every enabled
//! instance and runs until SIGINT/SIGTERM.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use std::sync::Arc;

use server_proxy_r::config::{self, ConnConfig, NodeFile};
use server_proxy_r::core::{AdmissionGuard, Notifier, Server};
use server_proxy_r::logger::{self, log};
use server_proxy_r::manager::InstanceManager;
use server_proxy_r::notify::{LogNotifier, Notification, TrafficWatcher};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = config::CliArgs::parse_args();
    cli.validate()?;

    // Initialize logger
    logger::init_logger(&cli.log_mode);

    log::info!(config = %cli.config.display(), "Starting proxy node");

    let node = NodeFile::load(&cli.config)?;

    // Admission guard shared by every inbound
    let guard = Arc::new(AdmissionGuard::new());
    node.guard.apply(&guard).context("Invalid guard seed")?;
    let _sweeper = guard.spawn_sweeper();

    // Build server using the builder pattern
    let server = Arc::new(
        Server::builder()
            .guard(Arc::clone(&guard))
            .conn_config(ConnConfig::from_cli(&cli))
            .build(),
    );

    let manager = Arc::new(InstanceManager::new(Arc::clone(&server)));
    for descriptor in node.instances {
        let id = descriptor.id;
        if let Err(e) = manager.create(descriptor).await {
            log::error!(instance = id, error = %e, "Invalid instance, skipped");
        }
    }

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new(&node.settings));
    for (id, e) in manager.start_all().await {
        let notification =
            Notification::instance_failure(&node.settings.recipients, id, &e.to_string());
        if let Err(e) = notifier.notify(notification).await {
            log::warn!(instance = id, error = %e, "Failed to deliver failure notification");
        }
    }
    log::info!(instances = manager.len().await, "Proxy node started");

    // Start background traffic watcher
    let watcher = TrafficWatcher::new(node.settings.clone(), Arc::clone(&manager), notifier)
        .start(cli.traffic_check_interval);

    wait_for_shutdown().await?;

    manager.stop_all().await;
    watcher.shutdown().await;
    guard.shutdown();
    log::info!("Proxy node stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM")?;

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
        log::info!("Shutdown signal received...");
    }

    Ok(())
}
