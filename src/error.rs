//! Error types for transfers in progress.

use std::io;

use thiserror::Error;

use crate::protocol::{ErrorCode, PacketError};

/// Why a transfer ended short of completion.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The peer sent something that does not decode.
    #[error("malformed packet from peer: {0}")]
    Malformed(#[from] PacketError),

    /// The peer sent a packet type the state machine cannot accept here.
    #[error("unexpected {got} while waiting for {wanted}")]
    UnexpectedPacket {
        wanted: &'static str,
        got: &'static str,
    },

    /// The peer jumped ahead of the lock-step window.
    #[error("block {got} out of sequence (last in-sequence block {last})")]
    BlockOutOfSequence { last: u16, got: u16 },

    /// The peer aborted the transfer with an ERROR packet.
    #[error("peer error {code}: {message}")]
    Peer { code: ErrorCode, message: String },

    /// No usable reply arrived, even after the final re-send.
    #[error("no reply from peer after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// The 16-bit block counter would wrap; the file is too large.
    #[error("file exceeds the 65535-block limit")]
    BlockLimit,

    /// Local file I/O failed.
    #[error("file I/O error: {0}")]
    File(io::Error),

    /// The transfer socket failed; the peer cannot be notified.
    #[error("socket error: {0}")]
    Socket(io::Error),
}

impl TransferError {
    /// The ERROR code to report to the peer before giving up, for the
    /// failures the peer should hear about. Inbound ERRORs, retry
    /// exhaustion and socket failures terminate silently.
    pub fn reply_code(&self) -> Option<ErrorCode> {
        match self {
            TransferError::Malformed(_)
            | TransferError::UnexpectedPacket { .. }
            | TransferError::BlockOutOfSequence { .. } => Some(ErrorCode::IllegalOperation),
            TransferError::File(_) => Some(ErrorCode::DiskFull),
            // Refusing to wrap the counter is a local decision made
            // while the channel is still up, so the peer is told (as
            // code 0; the RFC has no code for it), unlike the silent
            // cases below where the peer is gone or already knows.
            TransferError::BlockLimit => Some(ErrorCode::Undefined),
            TransferError::Peer { .. }
            | TransferError::Exhausted { .. }
            | TransferError::Socket(_) => None,
        }
    }
}
