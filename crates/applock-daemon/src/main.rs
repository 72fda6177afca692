//! AppLock Daemon - Main entry point
//!
//! The daemon watches the foreground application and keeps protected
//! packages behind a PIN, pattern or biometric challenge.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use applock_daemon::{assemble, enforcer, EnforcementConfig, IpcServer, MonotonicClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "applock_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting AppLock daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load or create config
    let config_path = std::env::var("APPLOCK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| EnforcementConfig::default_path());

    let config = if config_path.exists() {
        EnforcementConfig::load(&config_path)?
    } else {
        let config = EnforcementConfig::default();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        config.save(&config_path)?;
        info!("Created default config at {:?}", config_path);
        config
    };

    // Ensure directories exist
    config.ensure_directories()?;

    let socket_path = config.control_socket_path.clone();
    let components = assemble(config, Some(config_path), Arc::new(MonotonicClock::new()))?;
    let ipc_server = IpcServer::new(socket_path, components.context);

    let enforcer_handle = enforcer::spawn(components.enforcer);

    // Start IPC server
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server.run().await {
            error!("IPC server error: {}", e);
        }
    });

    info!("Daemon started successfully");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = enforcer_handle => {
            error!("Enforcer exited unexpectedly");
        }
        _ = ipc_handle => {
            error!("IPC server exited unexpectedly");
        }
    }

    info!("Daemon shutting down");

    Ok(())
}
