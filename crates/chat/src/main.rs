//! chatterbox - terminal client for a chatterbox server

use anyhow::{Context, Result};
use chatterbox_core::logging;
use clap::Parser;
use tokio::net::TcpStream;
use tracing::debug;

mod client;

/// chatterbox - terminal client for a chatterbox server
#[derive(Parser, Debug)]
#[command(name = "chatterbox")]
#[command(about = "Connect to a chatterbox server")]
#[command(version)]
struct Args {
    /// Server host name or address
    host: String,

    /// Server TCP port
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(logging::CLIENT_DEFAULT);

    let stream = TcpStream::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("Failed to connect to {}:{}", args.host, args.port))?;
    debug!(host = %args.host, port = args.port, "Connected");

    let ending = client::run(stream, tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Connection lost")?;
    debug!(?ending, "Disconnected");

    // A pending stdin read would hold up runtime shutdown.
    std::process::exit(0);
}
