//! Client drivers: one download, one upload.
//!
//! Both send their request to the server's well-known port and carry on
//! against whatever ephemeral port the server answers from.

use std::net::SocketAddr;
use std::path::Path;

use tokio::fs::File;
use tracing::{debug, info};

use crate::error::TransferError;
use crate::protocol::{Mode, Packet};
use crate::transfer::{self, Peer, RetryPolicy};

/// Fetch `remote` from the server into `local`. On failure the
/// partially written local file is removed.
pub async fn download(
    server: SocketAddr,
    remote: &str,
    local: &Path,
    policy: &RetryPolicy,
) -> Result<u64, TransferError> {
    let sock = transfer::bind_ephemeral(server)
        .await
        .map_err(TransferError::Socket)?;
    let mut file = File::create(local).await.map_err(TransferError::File)?;

    let request = Packet::RRQ {
        filename: remote.to_string(),
        mode: Mode::Octet,
    }
    .to_bytes();
    info!(%server, remote, "requesting download");

    match transfer::receive_file(&sock, Peer::unlocked(server), request, &mut file, policy).await {
        Ok(bytes) => {
            info!(bytes, "download complete");
            Ok(bytes)
        }
        Err(err) => {
            drop(file);
            if let Err(remove_err) = tokio::fs::remove_file(local).await {
                debug!(%remove_err, "partial file not removed");
            }
            Err(err)
        }
    }
}

/// Send `local` to the server as `remote`.
pub async fn upload(
    server: SocketAddr,
    local: &Path,
    remote: &str,
    policy: &RetryPolicy,
) -> Result<u64, TransferError> {
    let sock = transfer::bind_ephemeral(server)
        .await
        .map_err(TransferError::Socket)?;
    let mut file = File::open(local).await.map_err(TransferError::File)?;

    let request = Packet::WRQ {
        filename: remote.to_string(),
        mode: Mode::Octet,
    }
    .to_bytes();
    info!(%server, remote, "requesting upload");

    // The request is acknowledged with ACK 0 from the server's
    // ephemeral port, which becomes the peer for the data phase.
    let mut peer = Peer::unlocked(server);
    let (_ack, src) = transfer::send_and_wait(
        &sock,
        &request,
        server,
        policy,
        transfer::classify_ack(peer, 0),
    )
    .await?;
    peer.lock(src);
    debug!(tid = %src, "write request acknowledged");

    let bytes = transfer::send_file(&sock, peer, &mut file, policy).await?;
    info!(bytes, "upload complete");
    Ok(bytes)
}
