//! chatterbox-server - multi-user line-oriented chat server

use anyhow::{Context, Result};
use chatterbox_core::config::{ConfigOverrides, resolve_config};
use chatterbox_core::logging;
use chatterbox_server::start_server;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// chatterbox-server - multi-user line-oriented chat server
#[derive(Parser, Debug)]
#[command(name = "chatterbox-server")]
#[command(about = "Multi-user line-oriented chat server")]
#[command(version)]
struct Args {
    /// TCP port to listen on
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(logging::SERVER_DEFAULT);

    let current_dir = std::env::current_dir().context("Failed to get current directory")?;
    let overrides = ConfigOverrides {
        port: Some(args.port),
        ..Default::default()
    };
    let config =
        resolve_config(&overrides, &current_dir).context("Failed to resolve configuration")?;

    let cancel = CancellationToken::new();
    let handle = start_server(config, cancel.clone())
        .await
        .context("Failed to start server")?;
    info!("chatterbox-server {} ready on {}", env!("CARGO_PKG_VERSION"), handle.local_addr());

    wait_for_signal().await;
    cancel.cancel();
    handle.shutdown().await;

    info!("chatterbox-server shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                if let Err(e) = ctrl_c.await {
                    warn!("Failed to listen for Ctrl+C: {e}");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        match ctrl_c.await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => warn!("Failed to listen for Ctrl+C: {e}"),
        }
    }
}
