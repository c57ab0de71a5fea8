//! An RFC 1350 TFTP server and client.
//!
//! Binary ("octet") transfers only, 512-byte blocks, lock-step with
//! bounded retransmission. The server isolates every transfer on its
//! own ephemeral socket; the client adopts the server's transfer
//! identifier from its first reply.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transfer;

pub use error::TransferError;
pub use protocol::{BLOCK_SIZE, ErrorCode, Mode, Packet, PacketError};
pub use server::{Server, TFTP_PORT};
pub use transfer::{MAX_RETRIES, RetryPolicy, TIMEOUT};
