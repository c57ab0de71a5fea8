use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tftpkit::{RetryPolicy, TFTP_PORT, client};

/// An RFC 1350 TFTP client.
#[derive(Parser, Debug)]
#[command(name = "tftp", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Server UDP port.
    #[arg(short, long, default_value_t = TFTP_PORT, global = true)]
    port: u16,

    /// Seconds to wait for a reply before re-sending.
    #[arg(long, default_value_t = 3, global = true)]
    timeout: u64,

    /// Re-sends of an unanswered packet before giving up.
    #[arg(long, default_value_t = 5, global = true)]
    retries: u32,

    /// Log per-packet detail.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a file from the server.
    Get {
        /// Server IP address.
        server: IpAddr,
        /// File to request from the server.
        remote: String,
        /// Local destination (defaults to the remote name).
        local: Option<PathBuf>,
    },
    /// Upload a local file to the server.
    Put {
        /// Server IP address.
        server: IpAddr,
        /// File to send.
        local: PathBuf,
        /// Name to store it under (defaults to the local file name).
        remote: Option<String>,
    },
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

    let policy = RetryPolicy {
        timeout: Duration::from_secs(cli.timeout),
        max_retries: cli.retries,
    };

    match cli.command {
        Command::Get {
            server,
            remote,
            local,
        } => {
            let local = local.unwrap_or_else(|| PathBuf::from(&remote));
            let addr = SocketAddr::new(server, cli.port);
            client::download(addr, &remote, &local, &policy)
                .await
                .with_context(|| format!("download of {remote:?} failed"))?;
        }
        Command::Put {
            server,
            local,
            remote,
        } => {
            let remote = match remote {
                Some(name) => name,
                None => local
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .with_context(|| format!("cannot derive a remote name from {local:?}"))?,
            };
            let addr = SocketAddr::new(server, cli.port);
            client::upload(addr, &local, &remote, &policy)
                .await
                .with_context(|| format!("upload of {local:?} failed"))?;
        }
    }

    Ok(())
}
