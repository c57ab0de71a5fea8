//! The lock-step transfer core: a bounded send-and-wait primitive and
//! the two engine skeletons built on it.
//!
//! TFTP's four per-transfer state machines (client and server, read and
//! write) collapse into two roles: the side that sends DATA and collects
//! ACKs, and the side that sends ACKs and collects DATA. Both run the
//! same retransmission discipline and differ only in the packet they
//! keep re-sending: the DATA sender must buffer its last packet, while
//! the receiver can always rebuild its last ACK from the block counter.

use std::net::SocketAddr;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant, timeout_at};
use tracing::{debug, warn};

use crate::error::TransferError;
use crate::protocol::{BLOCK_SIZE, ErrorCode, Packet};

/// How long to wait for the peer's reply before re-sending.
pub const TIMEOUT: Duration = Duration::from_secs(3);

/// Re-sends of an unanswered packet before giving up.
pub const MAX_RETRIES: u32 = 5;

/// Receive buffer: big enough to notice datagrams that exceed the
/// largest well-formed TFTP packet instead of silently truncating them.
const RECV_BUF_SIZE: usize = 2 * (4 + BLOCK_SIZE);

/// Retransmission knobs. The defaults are the conventional 3 s window
/// and 5 re-sends.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: TIMEOUT,
            max_retries: MAX_RETRIES,
        }
    }
}

/// The remote transfer identifier: an (address, port) pair.
///
/// A server worker knows the full pair from the initial request. A
/// client only knows the server's address and well-known port; the
/// ephemeral port the server picked is adopted from the first valid
/// reply, after which the pair is fixed for the life of the transfer.
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    addr: SocketAddr,
    locked: bool,
}

impl Peer {
    /// A fully known peer (server side: the requester's source tuple).
    pub fn locked(addr: SocketAddr) -> Self {
        Self { addr, locked: true }
    }

    /// A peer whose port is still the well-known one (client side,
    /// before the server's first reply).
    pub fn unlocked(addr: SocketAddr) -> Self {
        Self {
            addr,
            locked: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether a datagram from `src` belongs to this transfer.
    pub fn accepts(&self, src: SocketAddr) -> bool {
        if self.locked {
            src == self.addr
        } else {
            src.ip() == self.addr.ip()
        }
    }

    /// Fix the pair to the source of the first valid reply. No-op once
    /// locked.
    pub fn lock(&mut self, src: SocketAddr) {
        if !self.locked {
            self.addr = src;
            self.locked = true;
        }
    }
}

/// What the engine's classifier decided about an inbound datagram.
pub(crate) enum Verdict {
    /// The packet the state machine was waiting for.
    Accept(Packet),
    /// A duplicate the peer sent because it missed our last reply;
    /// answer with these bytes and keep waiting in the same window.
    Reply(Vec<u8>),
    /// Wrong source tuple; answered with ERROR 5, transfer undisturbed.
    Stray,
    /// The transfer cannot continue.
    Fatal(TransferError),
    /// Noise; keep waiting in the same window.
    Ignore,
}

/// Send `packet` to `dest` and wait for a datagram that `classify`
/// accepts. Duplicates and strays are answered without resetting the
/// timeout window; each timeout re-sends `packet` and opens a new
/// window, up to `policy.max_retries` re-sends.
pub(crate) async fn send_and_wait<F>(
    sock: &UdpSocket,
    packet: &[u8],
    dest: SocketAddr,
    policy: &RetryPolicy,
    mut classify: F,
) -> Result<(Packet, SocketAddr), TransferError>
where
    F: FnMut(&[u8], SocketAddr) -> Verdict,
{
    let mut buf = [0u8; RECV_BUF_SIZE];
    let mut retries = 0u32;

    sock.send_to(packet, dest)
        .await
        .map_err(TransferError::Socket)?;
    let mut deadline = Instant::now() + policy.timeout;

    loop {
        match timeout_at(deadline, sock.recv_from(&mut buf)).await {
            Ok(Ok((len, src))) => match classify(&buf[..len], src) {
                Verdict::Accept(reply) => return Ok((reply, src)),
                Verdict::Reply(bytes) => {
                    debug!(%src, "re-acknowledging duplicate");
                    sock.send_to(&bytes, src)
                        .await
                        .map_err(TransferError::Socket)?;
                }
                Verdict::Stray => {
                    warn!(%src, "stray datagram on transfer socket");
                    let error = Packet::error(
                        ErrorCode::UnknownTransferId,
                        ErrorCode::UnknownTransferId.message(),
                    );
                    sock.send_to(&error.to_bytes(), src)
                        .await
                        .map_err(TransferError::Socket)?;
                }
                Verdict::Fatal(err) => return Err(err),
                Verdict::Ignore => {}
            },
            Ok(Err(err)) => return Err(TransferError::Socket(err)),
            Err(_) => {
                if retries == policy.max_retries {
                    return Err(TransferError::Exhausted {
                        attempts: retries + 1,
                    });
                }
                retries += 1;
                debug!(retries, "window expired, re-sending");
                sock.send_to(packet, dest)
                    .await
                    .map_err(TransferError::Socket)?;
                deadline = Instant::now() + policy.timeout;
            }
        }
    }
}

/// Classifier for the side waiting on a DATA packet. `current` is the
/// last block accepted (0 before the first).
pub(crate) fn classify_data(peer: Peer, current: u16) -> impl FnMut(&[u8], SocketAddr) -> Verdict {
    move |datagram, src| {
        if !peer.accepts(src) {
            return Verdict::Stray;
        }
        let packet = match Packet::from_bytes(datagram) {
            Ok(packet) => packet,
            Err(err) => return Verdict::Fatal(err.into()),
        };
        match packet {
            Packet::DATA { block, payload } => {
                if current.checked_add(1) == Some(block) {
                    Verdict::Accept(Packet::DATA { block, payload })
                } else if block <= current {
                    // The peer missed our ACK; acknowledge again.
                    Verdict::Reply(Packet::ACK { block }.to_bytes())
                } else {
                    Verdict::Fatal(TransferError::BlockOutOfSequence {
                        last: current,
                        got: block,
                    })
                }
            }
            Packet::ERROR { code, message } => Verdict::Fatal(TransferError::Peer { code, message }),
            other => Verdict::Fatal(TransferError::UnexpectedPacket {
                wanted: "DATA",
                got: other.name(),
            }),
        }
    }
}

/// Classifier for the side waiting on an ACK for block `current`.
pub(crate) fn classify_ack(peer: Peer, current: u16) -> impl FnMut(&[u8], SocketAddr) -> Verdict {
    move |datagram, src| {
        if !peer.accepts(src) {
            return Verdict::Stray;
        }
        let packet = match Packet::from_bytes(datagram) {
            Ok(packet) => packet,
            Err(err) => return Verdict::Fatal(err.into()),
        };
        match packet {
            // A stale ACK is ignored rather than answered with a
            // re-send; re-sending here would double every remaining
            // DATA packet (the Sorcerer's Apprentice failure mode).
            Packet::ACK { block } if block == current => Verdict::Accept(Packet::ACK { block }),
            Packet::ACK { block } if block < current => Verdict::Ignore,
            Packet::ACK { block } => Verdict::Fatal(TransferError::BlockOutOfSequence {
                last: current,
                got: block,
            }),
            Packet::ERROR { code, message } => Verdict::Fatal(TransferError::Peer { code, message }),
            other => Verdict::Fatal(TransferError::UnexpectedPacket {
                wanted: "ACK",
                got: other.name(),
            }),
        }
    }
}

/// Drive the DATA-sending half of a transfer: a server answering an RRQ,
/// or a client whose WRQ has been acknowledged. `peer` must already be
/// locked. Returns the number of payload bytes delivered.
pub async fn send_file(
    sock: &UdpSocket,
    peer: Peer,
    file: &mut File,
    policy: &RetryPolicy,
) -> Result<u64, TransferError> {
    let result = send_blocks(sock, peer, file, policy).await;
    report_abort(sock, peer.addr(), &result).await;
    result
}

async fn send_blocks(
    sock: &UdpSocket,
    peer: Peer,
    file: &mut File,
    policy: &RetryPolicy,
) -> Result<u64, TransferError> {
    let mut block: u16 = 1;
    let mut total: u64 = 0;
    let mut chunk = vec![0u8; BLOCK_SIZE];

    loop {
        let len = read_block(file, &mut chunk).await?;
        let data = Packet::DATA {
            block,
            payload: chunk[..len].to_vec(),
        }
        .to_bytes();

        send_and_wait(sock, &data, peer.addr(), policy, classify_ack(peer, block)).await?;
        total += len as u64;
        debug!(block, len, "block acknowledged");

        // A payload short of a full block is the end-of-transfer signal;
        // a file of exactly N * 512 bytes ends with an empty DATA.
        if len < BLOCK_SIZE {
            return Ok(total);
        }
        block = block.checked_add(1).ok_or(TransferError::BlockLimit)?;
    }
}

/// Drive the DATA-receiving half of a transfer: a server answering a
/// WRQ, or a client performing an RRQ.
///
/// `request` is the packet that solicits the first DATA block: the
/// server's ACK 0, or the client's RRQ. On the client side `peer` is
/// still unlocked and the source of the first in-sequence DATA becomes
/// the transfer identifier. Returns the number of payload bytes written.
pub async fn receive_file(
    sock: &UdpSocket,
    mut peer: Peer,
    request: Vec<u8>,
    file: &mut File,
    policy: &RetryPolicy,
) -> Result<u64, TransferError> {
    let result = receive_blocks(sock, &mut peer, request, file, policy).await;
    report_abort(sock, peer.addr(), &result).await;
    result
}

async fn receive_blocks(
    sock: &UdpSocket,
    peer: &mut Peer,
    request: Vec<u8>,
    file: &mut File,
    policy: &RetryPolicy,
) -> Result<u64, TransferError> {
    let mut current: u16 = 0;
    let mut total: u64 = 0;
    let mut pending = request;

    loop {
        let (packet, src) = send_and_wait(
            sock,
            &pending,
            peer.addr(),
            policy,
            classify_data(*peer, current),
        )
        .await?;
        peer.lock(src);

        let (block, payload) = match packet {
            Packet::DATA { block, payload } => (block, payload),
            other => {
                return Err(TransferError::UnexpectedPacket {
                    wanted: "DATA",
                    got: other.name(),
                });
            }
        };

        file.write_all(&payload)
            .await
            .map_err(TransferError::File)?;
        current = block;
        total += payload.len() as u64;
        debug!(block, len = payload.len(), "block written");

        pending = Packet::ACK { block }.to_bytes();
        if payload.len() < BLOCK_SIZE {
            file.flush().await.map_err(TransferError::File)?;
            sock.send_to(&pending, peer.addr())
                .await
                .map_err(TransferError::Socket)?;
            return Ok(total);
        }
    }
}

/// Bind an ephemeral UDP socket in the same address family as `peer`.
pub(crate) async fn bind_ephemeral(peer: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind_addr: SocketAddr = if peer.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    UdpSocket::bind(bind_addr).await
}

/// Best-effort ERROR notification for failures the peer should hear
/// about; see [`TransferError::reply_code`].
async fn report_abort(sock: &UdpSocket, dest: SocketAddr, result: &Result<u64, TransferError>) {
    if let Err(err) = result
        && let Some(code) = err.reply_code()
    {
        let packet = Packet::error(code, code.message());
        let _ = sock.send_to(&packet.to_bytes(), dest).await;
    }
}

/// Fill `buf` from the file, tolerating short reads; only end-of-file
/// yields less than a full buffer.
async fn read_block(file: &mut File, buf: &mut [u8]) -> Result<usize, TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file
            .read(&mut buf[filled..])
            .await
            .map_err(TransferError::File)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn unlocked_peer_accepts_any_port_on_same_ip() {
        let peer = Peer::unlocked(addr(69));
        assert!(peer.accepts(addr(40000)));
        assert!(!peer.accepts("10.0.0.1:69".parse().unwrap()));
    }

    #[test]
    fn locked_peer_requires_exact_tuple() {
        let peer = Peer::locked(addr(40000));
        assert!(peer.accepts(addr(40000)));
        assert!(!peer.accepts(addr(40001)));
    }

    #[test]
    fn lock_fixes_the_first_source() {
        let mut peer = Peer::unlocked(addr(69));
        peer.lock(addr(40000));
        peer.lock(addr(40001));
        assert_eq!(peer.addr(), addr(40000));
        assert!(!peer.accepts(addr(40001)));
    }

    #[tokio::test]
    async fn exhaustion_after_bounded_resends() {
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = silent.local_addr().unwrap();

        let policy = RetryPolicy {
            timeout: Duration::from_millis(50),
            max_retries: 2,
        };
        let result = send_and_wait(&sender, b"ping", dest, &policy, |_, _| Verdict::Ignore).await;
        match result {
            Err(TransferError::Exhausted { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }

        // One initial copy plus max_retries re-sends.
        let mut copies = 0;
        let mut buf = [0u8; 16];
        while tokio::time::timeout(Duration::from_millis(50), silent.recv_from(&mut buf))
            .await
            .is_ok()
        {
            copies += 1;
        }
        assert_eq!(copies, 3);
    }

    #[tokio::test]
    async fn duplicate_data_is_reacknowledged_within_window() {
        let engine = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let engine_addr = engine.local_addr().unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let policy = RetryPolicy {
            timeout: Duration::from_secs(2),
            max_retries: 1,
        };
        let peer = Peer::locked(remote_addr);
        let ack1 = Packet::ACK { block: 1 }.to_bytes();
        let waiter = tokio::spawn(async move {
            send_and_wait(&engine, &ack1, remote_addr, &policy, classify_data(peer, 1)).await
        });

        let mut buf = [0u8; 600];
        // The window opens with our ACK 1.
        let (n, _) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(Packet::from_bytes(&buf[..n]).unwrap(), Packet::ACK { block: 1 });

        // A duplicate DATA 1 gets re-acknowledged without ending the wait.
        let dup = Packet::DATA {
            block: 1,
            payload: vec![7; BLOCK_SIZE],
        };
        remote.send_to(&dup.to_bytes(), engine_addr).await.unwrap();
        let (n, _) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(Packet::from_bytes(&buf[..n]).unwrap(), Packet::ACK { block: 1 });

        // The in-sequence DATA 2 is what the engine accepts.
        let next = Packet::DATA {
            block: 2,
            payload: b"tail".to_vec(),
        };
        remote.send_to(&next.to_bytes(), engine_addr).await.unwrap();
        let (packet, src) = waiter.await.unwrap().unwrap();
        assert_eq!(src, remote_addr);
        assert_eq!(packet, next);
    }
}
