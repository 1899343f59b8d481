//! Station service entry point.
//!
//! Loads configuration, builds the control plane and serves RPC until a
//! shutdown signal arrives.

mod cli;
mod config;
mod signals;

use std::sync::Arc;

use anyhow::Result;
use station_core::logging::setup_logging;
use station_core::{Collaborators, ConfigStore, RpcServer, StationService};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cli::CliArgs;
use crate::signals::{Signal, Signals};

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();
    if let Err(e) = run(args).await {
        error!("❌ {:#}", e);
        eprintln!("❌ Failed to run station service: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<()> {
    let config = config::load(&args).await?;
    setup_logging(&config.logging)?;
    display_banner();

    let store = Arc::new(ConfigStore::from_loaded(&args.config_path, config));
    let (directory, rpc_bind) =
        store.read(|c| (c.server.directory.clone(), c.server.rpc_bind.clone()));
    info!(
        "📂 Config: {} | Server directory: {}",
        args.config_path.display(),
        directory.display()
    );

    let service = Arc::new(StationService::new(
        store.clone(),
        Collaborators::external(&store),
    ));

    let shutdown = CancellationToken::new();
    let rpc = RpcServer::bind(service.clone(), &rpc_bind).await?;
    let rpc_task = tokio::spawn(rpc.serve(shutdown.clone()));

    service.start().await;
    info!("✅ Station service is running");
    info!("🛑 Press Ctrl+C to gracefully shutdown");

    let mut signals = Signals::new()?;
    loop {
        match signals.recv().await? {
            Signal::Shutdown => break,
            Signal::Reload => match service.reload_config().await {
                Ok(()) => info!("🔄 Configuration reloaded"),
                Err(e) => error!("❌ Configuration reload failed: {}", e),
            },
        }
    }

    info!("🛑 Shutdown signal received, initiating graceful shutdown...");
    shutdown.cancel();
    if let Err(e) = rpc_task.await {
        error!("❌ RPC listener task failed: {}", e);
    }
    service.shutdown().await;

    info!("👋 Station service stopped");
    Ok(())
}

fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║             🛰️ STATION SERVICE            ║");
    info!("║                  v{:<22} ║", version);
    info!("╚══════════════════════════════════════════╝");
}
