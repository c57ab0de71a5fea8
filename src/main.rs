use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use tftpkit::{Server, TFTP_PORT};

/// An RFC 1350 TFTP server.
#[derive(Parser, Debug)]
#[command(name = "tftpd", version, about)]
struct Cli {
    /// UDP port to listen on.
    #[arg(short, long, default_value_t = TFTP_PORT)]
    port: u16,

    /// Directory to serve and receive files.
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Log per-packet detail.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "tftpkit=debug" } else { "tftpkit=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let addr: SocketAddr = format!("0.0.0.0:{}", cli.port).parse()?;
    let server = Server::bind(addr, &cli.dir).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    server.serve(shutdown_rx).await
}
