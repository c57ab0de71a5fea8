//! The TFTP server: a dispatcher on the well-known port and one worker
//! task per transfer.
//!
//! The dispatcher only ever decodes initial requests. Each accepted
//! request gets its own task with its own ephemeral socket, so the
//! kernel enforces the transfer-identifier discipline and a slow or
//! failing transfer never delays the next request.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::fs::{File, OpenOptions};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::protocol::{ErrorCode, Mode, Packet};
use crate::transfer::{self, Peer, RetryPolicy};

/// The well-known TFTP port.
pub const TFTP_PORT: u16 = 69;

/// Initial requests are small; anything larger than this is noise.
const REQUEST_BUF_SIZE: usize = 1024;

pub struct Server {
    sock: UdpSocket,
    root: PathBuf,
}

impl Server {
    /// Bind the listening socket. `root` becomes the file root for all
    /// transfers and must already exist.
    pub async fn bind(addr: SocketAddr, root: impl AsRef<Path>) -> Result<Self> {
        let root = tokio::fs::canonicalize(root.as_ref())
            .await
            .with_context(|| format!("served directory {:?}", root.as_ref()))?;
        let sock = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("cannot bind {addr}"))?;
        Ok(Self { sock, root })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Accept requests until `shutdown` flips. Workers already running
    /// finish (or time out) on their own.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(addr = %self.sock.local_addr()?, root = %self.root.display(), "listening");
        let root = Arc::new(self.root);
        let mut buf = vec![0u8; REQUEST_BUF_SIZE];

        loop {
            tokio::select! {
                received = self.sock.recv_from(&mut buf) => {
                    let (len, src) = received.context("listener receive failed")?;
                    dispatch(&buf[..len], src, &root);
                }
                _ = shutdown.changed() => {
                    info!("shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Decode one datagram from the listener and hand RRQ/WRQ to a worker.
/// Everything else is logged and dropped.
fn dispatch(datagram: &[u8], src: SocketAddr, root: &Arc<PathBuf>) {
    let packet = match Packet::from_bytes(datagram) {
        Ok(packet) => packet,
        Err(err) => {
            warn!(%src, %err, "undecodable datagram on listener");
            return;
        }
    };

    match packet {
        Packet::RRQ { filename, mode } => {
            let root = Arc::clone(root);
            tokio::spawn(async move {
                if let Err(err) = serve_read(src, &filename, mode, &root).await {
                    warn!(%src, %filename, %err, "read transfer failed");
                }
            });
        }
        Packet::WRQ { filename, mode } => {
            let root = Arc::clone(root);
            tokio::spawn(async move {
                if let Err(err) = serve_write(src, &filename, mode, &root).await {
                    warn!(%src, %filename, %err, "write transfer failed");
                }
            });
        }
        other => warn!(%src, packet = other.name(), "non-request packet on listener"),
    }
}

/// Worker for an inbound read request: the client downloads from us.
async fn serve_read(src: SocketAddr, filename: &str, mode: Mode, root: &Path) -> Result<()> {
    let sock = transfer::bind_ephemeral(src).await?;
    let peer = Peer::locked(src);

    if mode != Mode::Octet {
        refuse(&sock, src, ErrorCode::Undefined, "Only octet mode is supported").await;
        return Err(anyhow!("refused non-octet mode {mode}"));
    }

    let path = match sanitize_path(root, filename) {
        Ok(path) => path,
        Err(err) => {
            refuse(&sock, src, ErrorCode::AccessViolation, ErrorCode::AccessViolation.message())
                .await;
            return Err(err);
        }
    };

    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            let code = open_error_code(&err);
            refuse(&sock, src, code, code.message()).await;
            return Err(anyhow!(err).context(format!("cannot open {}", path.display())));
        }
    };

    info!(%src, filename, "read transfer started");
    let sent = transfer::send_file(&sock, peer, &mut file, &RetryPolicy::default()).await?;
    info!(%src, filename, bytes = sent, "read transfer complete");
    Ok(())
}

/// Worker for an inbound write request: the client uploads to us. A
/// failed transfer leaves the partial file behind for inspection.
async fn serve_write(src: SocketAddr, filename: &str, mode: Mode, root: &Path) -> Result<()> {
    let sock = transfer::bind_ephemeral(src).await?;
    let peer = Peer::locked(src);

    if mode != Mode::Octet {
        refuse(&sock, src, ErrorCode::Undefined, "Only octet mode is supported").await;
        return Err(anyhow!("refused non-octet mode {mode}"));
    }

    let path = match sanitize_path(root, filename) {
        Ok(path) => path,
        Err(err) => {
            refuse(&sock, src, ErrorCode::AccessViolation, ErrorCode::AccessViolation.message())
                .await;
            return Err(err);
        }
    };

    if let Some(parent) = path.parent()
        && let Err(err) = tokio::fs::create_dir_all(parent).await
    {
        refuse(&sock, src, ErrorCode::AccessViolation, ErrorCode::AccessViolation.message()).await;
        return Err(anyhow!(err).context(format!("cannot create {}", parent.display())));
    }

    let mut file = match create_file(&path).await {
        Ok(file) => file,
        Err(err) => {
            let code = create_error_code(&err);
            refuse(&sock, src, code, code.message()).await;
            return Err(anyhow!(err).context(format!("cannot create {}", path.display())));
        }
    };

    info!(%src, filename, "write transfer started");
    let ack = Packet::ACK { block: 0 }.to_bytes();
    let written =
        transfer::receive_file(&sock, peer, ack, &mut file, &RetryPolicy::default()).await?;
    info!(%src, filename, bytes = written, "write transfer complete");
    Ok(())
}

/// Reject a request before any transfer state exists.
async fn refuse(sock: &UdpSocket, dest: SocketAddr, code: ErrorCode, message: &str) {
    let packet = Packet::error(code, message);
    if let Err(err) = sock.send_to(&packet.to_bytes(), dest).await {
        warn!(%dest, %err, "could not send rejection");
    }
}

fn open_error_code(err: &std::io::Error) -> ErrorCode {
    match err.kind() {
        std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
        std::io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
        _ => ErrorCode::Undefined,
    }
}

fn create_error_code(err: &std::io::Error) -> ErrorCode {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
        _ => ErrorCode::Undefined,
    }
}

async fn create_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o644);
    options.open(path).await
}

/// Resolve a requested name against the served root, refusing anything
/// that would land outside it. Requests may name subdirectories; `\` is
/// treated as a separator for clients that send Windows-style paths.
/// `root` must be canonical.
pub(crate) fn sanitize_path(root: &Path, filename: &str) -> Result<PathBuf> {
    let normalized = filename.replace('\\', "/");

    let mut clean = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return Err(anyhow!("path {filename:?} escapes the served root")),
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(anyhow!("empty path {filename:?}"));
    }

    let candidate = root.join(&clean);

    // For an existing target, canonicalise and check containment
    // (symlinks inside the tree may point anywhere). For a target still
    // to be created, check the deepest existing ancestor instead.
    let mut probe = candidate.as_path();
    loop {
        if probe.exists() {
            let resolved = probe
                .canonicalize()
                .with_context(|| format!("cannot resolve {}", probe.display()))?;
            if !resolved.starts_with(root) {
                return Err(anyhow!("path {filename:?} escapes the served root"));
            }
            return Ok(candidate);
        }
        probe = probe
            .parent()
            .ok_or_else(|| anyhow!("path {filename:?} escapes the served root"))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn served_root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    #[test]
    fn existing_target_resolves_under_root() {
        let (_dir, root) = served_root();
        std::fs::write(root.join("kernel.img"), b"x").unwrap();
        assert_eq!(
            sanitize_path(&root, "kernel.img").unwrap(),
            root.join("kernel.img")
        );
    }

    #[test]
    fn current_dir_components_are_dropped() {
        let (_dir, root) = served_root();
        std::fs::create_dir(root.join("boot")).unwrap();
        std::fs::write(root.join("boot/initrd"), b"x").unwrap();
        assert_eq!(
            sanitize_path(&root, "./boot/./initrd").unwrap(),
            root.join("boot/initrd")
        );
    }

    #[test]
    fn ancestor_walk_accepts_deep_new_target() {
        // Nothing below the root exists yet, so the containment check
        // walks all the way back up to the root itself.
        let (_dir, root) = served_root();
        assert_eq!(
            sanitize_path(&root, "a/b/c/upload.bin").unwrap(),
            root.join("a/b/c/upload.bin")
        );
    }

    #[test]
    fn parent_components_are_rejected_wherever_they_appear() {
        let (_dir, root) = served_root();
        // `a/b/..` would stay inside the root, but the component rule
        // is applied before any resolution happens.
        for name in ["..", "../flag", "a/../../flag", "a/b/.."] {
            assert!(sanitize_path(&root, name).is_err(), "{name}");
        }
    }

    #[test]
    fn absolute_paths_are_rejected_in_both_separator_styles() {
        let (_dir, root) = served_root();
        assert!(sanitize_path(&root, "/etc/passwd").is_err());
        // Backslashes are normalised first, so this one is absolute too.
        assert!(sanitize_path(&root, "\\etc\\passwd").is_err());
    }

    #[test]
    fn names_that_normalize_to_nothing_are_rejected() {
        let (_dir, root) = served_root();
        for name in ["", ".", "././."] {
            assert!(sanitize_path(&root, name).is_err(), "{name:?}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlink_pointing_outside_the_root_is_caught() {
        let (_dir, root) = served_root();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        // Caught both for an existing target (canonicalized directly)
        // and for a new one (canonicalized via the deepest ancestor).
        assert!(sanitize_path(&root, "link/secret").is_err());
        assert!(sanitize_path(&root, "link/new/upload.bin").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_staying_inside_the_root_is_allowed() {
        let (_dir, root) = served_root();
        std::fs::create_dir(root.join("images")).unwrap();
        std::fs::write(root.join("images/disk.img"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("images"), root.join("latest")).unwrap();
        assert_eq!(
            sanitize_path(&root, "latest/disk.img").unwrap(),
            root.join("latest/disk.img")
        );
    }
}
