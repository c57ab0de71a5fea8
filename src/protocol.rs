//! Packet codec for the five RFC 1350 packet types.
//!
//! Decoding is strict: anything that violates the framing rules comes
//! back as a [`PacketError`], and the caller answers with ERROR 4. The
//! codec itself is policy-free: non-octet modes decode fine and are
//! refused one layer up.

use std::fmt;

use thiserror::Error;

/// TFTP opcodes per RFC 1350.
const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;

/// Data payload per DATA packet (RFC 1350, not negotiable).
pub const BLOCK_SIZE: usize = 512;

/// Largest well-formed TFTP datagram: 4-byte DATA header + full payload.
pub const MAX_PACKET_SIZE: usize = 4 + BLOCK_SIZE;

/// Cap on filename, mode and error-message fields. Not an RFC limit; a
/// safety bound on peer-supplied strings.
const MAX_STRING_LEN: usize = 255;

/// Why a datagram failed to decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("unknown opcode {0}")]
    BadOpcode(u16),
    #[error("string field missing its null terminator")]
    MissingTerminator,
    #[error("string field exceeds {MAX_STRING_LEN} octets")]
    FieldTooLong,
    #[error("empty filename")]
    EmptyFilename,
    #[error("string field is not valid UTF-8")]
    BadString,
    #[error("unknown transfer mode {0:?}")]
    BadMode(String),
    #[error("DATA packet exceeds {MAX_PACKET_SIZE} octets")]
    Oversize,
    #[error("DATA block number 0")]
    BadBlockNumber,
    #[error("error code {0} out of range")]
    BadErrorCode(u16),
    #[error("ACK packet has trailing bytes")]
    TrailingBytes,
}

/// Transfer mode named in an RRQ or WRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Octet,
    Netascii,
    Mail,
}

impl Mode {
    fn parse(s: &str) -> Result<Self, PacketError> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Ok(Mode::Octet),
            "netascii" => Ok(Mode::Netascii),
            "mail" => Ok(Mode::Mail),
            _ => Err(PacketError::BadMode(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Octet => "octet",
            Mode::Netascii => "netascii",
            Mode::Mail => "mail",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ERROR packet codes per RFC 1350 §5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    fn from_u16(code: u16) -> Result<Self, PacketError> {
        Ok(match code {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            other => return Err(PacketError::BadErrorCode(other)),
        })
    }

    /// The RFC's standard message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::Undefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u16)
    }
}

/// A fully parsed TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Packet {
    RRQ { filename: String, mode: Mode },
    WRQ { filename: String, mode: Mode },
    DATA { block: u16, payload: Vec<u8> },
    ACK { block: u16 },
    ERROR { code: ErrorCode, message: String },
}

impl Packet {
    /// Parse raw bytes into a `Packet`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < 4 {
            return Err(PacketError::TooShort(buf.len()));
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match opcode {
            OPCODE_RRQ => parse_request(buf, true),
            OPCODE_WRQ => parse_request(buf, false),
            OPCODE_DATA => parse_data(buf),
            OPCODE_ACK => parse_ack(buf),
            OPCODE_ERROR => parse_error(buf),
            other => Err(PacketError::BadOpcode(other)),
        }
    }

    /// Serialize the packet to bytes for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::RRQ { filename, mode } => encode_request(OPCODE_RRQ, filename, *mode),
            Packet::WRQ { filename, mode } => encode_request(OPCODE_WRQ, filename, *mode),
            Packet::DATA { block, payload } => {
                debug_assert!(payload.len() <= BLOCK_SIZE);
                let mut buf = Vec::with_capacity(4 + payload.len());
                buf.extend_from_slice(&OPCODE_DATA.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(payload);
                buf
            }
            Packet::ACK { block } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OPCODE_ACK.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Packet::ERROR { code, message } => {
                let mut buf = Vec::with_capacity(5 + message.len());
                buf.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
                buf.extend_from_slice(&(*code as u16).to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
                buf
            }
        }
    }

    /// Build an ERROR packet.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::ERROR {
            code,
            message: message.into(),
        }
    }

    /// Wire name of the packet type, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::RRQ { .. } => "RRQ",
            Packet::WRQ { .. } => "WRQ",
            Packet::DATA { .. } => "DATA",
            Packet::ACK { .. } => "ACK",
            Packet::ERROR { .. } => "ERROR",
        }
    }
}

// ---------------------------------------------------------------------------
// Internal parsing helpers
// ---------------------------------------------------------------------------

/// Parse RRQ / WRQ: 2-byte opcode | filename\0 | mode\0
///
/// Anything past the mode terminator (RFC 2347 option lists from
/// option-aware clients) is ignored, so such clients still get plain
/// RFC 1350 service.
fn parse_request(buf: &[u8], is_read: bool) -> Result<Packet, PacketError> {
    let body = &buf[2..];
    let Some(name_end) = body.iter().position(|&b| b == 0) else {
        return Err(PacketError::MissingTerminator);
    };
    let name = &body[..name_end];
    let rest = &body[name_end + 1..];
    let Some(mode_end) = rest.iter().position(|&b| b == 0) else {
        return Err(PacketError::MissingTerminator);
    };
    let mode = &rest[..mode_end];

    if name.is_empty() {
        return Err(PacketError::EmptyFilename);
    }
    if name.len() > MAX_STRING_LEN || mode.len() > MAX_STRING_LEN {
        return Err(PacketError::FieldTooLong);
    }

    let filename = std::str::from_utf8(name)
        .map_err(|_| PacketError::BadString)?
        .to_string();
    let mode = Mode::parse(std::str::from_utf8(mode).map_err(|_| PacketError::BadString)?)?;

    Ok(if is_read {
        Packet::RRQ { filename, mode }
    } else {
        Packet::WRQ { filename, mode }
    })
}

/// Parse DATA: 2-byte opcode | 2-byte block# | 0..512 bytes
fn parse_data(buf: &[u8]) -> Result<Packet, PacketError> {
    if buf.len() > MAX_PACKET_SIZE {
        return Err(PacketError::Oversize);
    }
    let block = u16::from_be_bytes([buf[2], buf[3]]);
    if block == 0 {
        return Err(PacketError::BadBlockNumber);
    }
    Ok(Packet::DATA {
        block,
        payload: buf[4..].to_vec(),
    })
}

/// Parse ACK: 2-byte opcode | 2-byte block#
fn parse_ack(buf: &[u8]) -> Result<Packet, PacketError> {
    if buf.len() > 4 {
        return Err(PacketError::TrailingBytes);
    }
    Ok(Packet::ACK {
        block: u16::from_be_bytes([buf[2], buf[3]]),
    })
}

/// Parse ERROR: 2-byte opcode | 2-byte code | msg\0
fn parse_error(buf: &[u8]) -> Result<Packet, PacketError> {
    let code = ErrorCode::from_u16(u16::from_be_bytes([buf[2], buf[3]]))?;
    let rest = &buf[4..];
    let Some(end) = rest.iter().position(|&b| b == 0) else {
        return Err(PacketError::MissingTerminator);
    };
    if end > MAX_STRING_LEN {
        return Err(PacketError::FieldTooLong);
    }
    let message = String::from_utf8_lossy(&rest[..end]).into_owned();
    Ok(Packet::ERROR { code, message })
}

fn encode_request(opcode: u16, filename: &str, mode: Mode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + mode.as_str().len());
    buf.extend_from_slice(&opcode.to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_str().as_bytes());
    buf.push(0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet) -> Packet {
        Packet::from_bytes(&packet.to_bytes()).unwrap()
    }

    #[test]
    fn round_trip_rrq() {
        let packet = Packet::RRQ {
            filename: "hello.txt".into(),
            mode: Mode::Octet,
        };
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn round_trip_wrq() {
        let packet = Packet::WRQ {
            filename: "upload.bin".into(),
            mode: Mode::Netascii,
        };
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn round_trip_data() {
        let packet = Packet::DATA {
            block: 42,
            payload: vec![1, 2, 3],
        };
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn round_trip_empty_payload_data() {
        let packet = Packet::DATA {
            block: 3,
            payload: vec![],
        };
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn round_trip_ack() {
        let packet = Packet::ACK { block: 0 };
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn round_trip_error() {
        let packet = Packet::error(ErrorCode::FileNotFound, "File not found");
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn mode_is_case_insensitive() {
        let mut buf = 1u16.to_be_bytes().to_vec();
        buf.extend_from_slice(b"f\0OcTeT\0");
        match Packet::from_bytes(&buf).unwrap() {
            Packet::RRQ { mode, .. } => assert_eq!(mode, Mode::Octet),
            other => panic!("expected RRQ, got {other:?}"),
        }
    }

    #[test]
    fn unknown_mode_rejected() {
        let mut buf = 1u16.to_be_bytes().to_vec();
        buf.extend_from_slice(b"f\0base64\0");
        assert_eq!(
            Packet::from_bytes(&buf),
            Err(PacketError::BadMode("base64".into()))
        );
    }

    #[test]
    fn request_missing_terminator_rejected() {
        let mut bytes = Packet::RRQ {
            filename: "hello.txt".into(),
            mode: Mode::Octet,
        }
        .to_bytes();
        bytes.pop();
        assert_eq!(
            Packet::from_bytes(&bytes),
            Err(PacketError::MissingTerminator)
        );
    }

    #[test]
    fn error_missing_terminator_rejected() {
        let mut bytes = Packet::error(ErrorCode::AccessViolation, "denied").to_bytes();
        bytes.pop();
        assert_eq!(
            Packet::from_bytes(&bytes),
            Err(PacketError::MissingTerminator)
        );
    }

    #[test]
    fn short_packet_rejected() {
        assert_eq!(Packet::from_bytes(&[0, 4, 0]), Err(PacketError::TooShort(3)));
    }

    #[test]
    fn unknown_opcode_rejected() {
        assert_eq!(
            Packet::from_bytes(&[0, 6, 0, 0]),
            Err(PacketError::BadOpcode(6))
        );
        assert_eq!(
            Packet::from_bytes(&[0, 0, 0, 1]),
            Err(PacketError::BadOpcode(0))
        );
    }

    #[test]
    fn oversized_data_rejected() {
        let mut buf = 3u16.to_be_bytes().to_vec();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&[0u8; BLOCK_SIZE + 1]);
        assert_eq!(Packet::from_bytes(&buf), Err(PacketError::Oversize));
    }

    #[test]
    fn data_block_zero_rejected() {
        let buf = [0, 3, 0, 0, 0xaa];
        assert_eq!(Packet::from_bytes(&buf), Err(PacketError::BadBlockNumber));
    }

    #[test]
    fn ack_with_trailing_bytes_rejected() {
        let buf = [0, 4, 0, 1, 0];
        assert_eq!(Packet::from_bytes(&buf), Err(PacketError::TrailingBytes));
    }

    #[test]
    fn empty_filename_rejected() {
        let mut buf = 2u16.to_be_bytes().to_vec();
        buf.extend_from_slice(b"\0octet\0");
        assert_eq!(Packet::from_bytes(&buf), Err(PacketError::EmptyFilename));
    }

    #[test]
    fn overlong_filename_rejected() {
        let mut buf = 1u16.to_be_bytes().to_vec();
        buf.extend_from_slice(&[b'a'; 256]);
        buf.extend_from_slice(b"\0octet\0");
        assert_eq!(Packet::from_bytes(&buf), Err(PacketError::FieldTooLong));
    }

    #[test]
    fn error_code_out_of_range_rejected() {
        let buf = [0, 5, 0, 8, b'x', 0];
        assert_eq!(Packet::from_bytes(&buf), Err(PacketError::BadErrorCode(8)));
    }

    #[test]
    fn request_option_list_ignored() {
        let mut buf = 1u16.to_be_bytes().to_vec();
        buf.extend_from_slice(b"test.bin\0octet\0blksize\01432\0");
        assert_eq!(
            Packet::from_bytes(&buf).unwrap(),
            Packet::RRQ {
                filename: "test.bin".into(),
                mode: Mode::Octet,
            }
        );
    }
}
