//! gantry-daemon — mock Carvera CNC controller.
//!
//! Binds a TCP listener and emulates the machine's wire protocol so
//! controller software and test harnesses can run against it without
//! hardware. All machine state is in memory and dies with the process.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gantry_core::catalog::Catalog;
use gantry_core::clock::MachineClock;
use gantry_core::vfs::VirtualFs;
use gantry_daemon::server::{Server, ServerConfig};
use gantry_daemon::{COMMAND_CATALOG_JSON, VIRTUAL_FILES_JSON};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Mock Carvera CNC controller.
#[derive(Parser, Debug)]
#[command(name = "gantry-daemon", version, about)]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind to
    #[arg(long, default_value_t = 2222)]
    port: u16,

    /// Enable verbose (DEBUG) logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let catalog =
        Catalog::from_json(COMMAND_CATALOG_JSON).context("embedded command catalog is invalid")?;
    let vfs = VirtualFs::from_json(VIRTUAL_FILES_JSON);

    let config = ServerConfig {
        host: args.host.clone(),
        port: args.port,
    };
    let server = Server::bind(
        &config,
        Arc::new(catalog),
        Arc::new(vfs),
        Arc::new(MachineClock::new()),
    )
    .await
    .with_context(|| format!("failed to bind {}:{}", args.host, args.port))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run(shutdown_rx).await;
    Ok(())
}
