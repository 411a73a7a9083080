// RFC 1350 - The TFTP Protocol (Revision 2)
//
// Every field is a big-endian u16 except the NUL-terminated strings.
// Decoding always checks the length before reading a field.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use std::fmt;

use crate::error::{Result, TftpError};

pub const OPCODE_LEN: usize = 2;
pub const BLOCK_LEN: usize = 2;
pub const ERROR_CODE_LEN: usize = 2;

/// Maximum DATA payload (RFC 1350)
pub const DATA_MAX_SIZE: usize = 512;

/// Largest file a 16-bit block counter starting at 1 can carry
pub const FILE_MAX_SIZE: u64 = 65535 * DATA_MAX_SIZE as u64 - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,   // Read request
    Wrq = 2,   // Write request
    Data = 3,  // Data packet
    Ack = 4,   // Acknowledgment
    Error = 5, // Error packet
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> std::result::Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            _ => Err(TftpError::MalformedPacket(format!("unknown opcode {}", value))),
        }
    }
}

impl Opcode {
    /// Minimum datagram size for this opcode, opcode field included
    pub fn min_len(self) -> usize {
        match self {
            // two NUL terminators at least
            Opcode::Rrq | Opcode::Wrq => OPCODE_LEN + 2,
            Opcode::Data => OPCODE_LEN + BLOCK_LEN,
            Opcode::Ack => OPCODE_LEN + BLOCK_LEN,
            Opcode::Error => OPCODE_LEN + ERROR_CODE_LEN + 1,
        }
    }
}

// RFC 1350 - TFTP Error Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,       // Not defined, see error message
    FileNotFound = 1,     // File not found
    AccessViolation = 2,  // Access violation
    DiskFull = 3,         // Disk full or allocation exceeded
    IllegalOperation = 4, // Illegal TFTP operation
    UnknownTid = 5,       // Unknown transfer ID
    FileExists = 6,       // File already exists
    NoSuchUser = 7,       // No such user
}

const ERROR_MESSAGES: [&str; 8] = [
    "Unknown error",
    "File not found",
    "Access violation",
    "Disk full or allocation exceeded",
    "Illegal TFTP operation",
    "Unknown transfer ID",
    "File already exists",
    "No such user",
];

impl ErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn message(self) -> &'static str {
        ERROR_MESSAGES[self as usize]
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(ErrorCode::NotDefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTid),
            6 => Some(ErrorCode::FileExists),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// Filename and mode of an RRQ/WRQ, kept as the raw bytes the client sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: Bytes,
    pub mode: Bytes,
}

impl Request {
    /// Only raw binary streaming is served
    pub fn is_octet(&self) -> bool {
        self.mode.eq_ignore_ascii_case(b"octet")
    }

    /// Filename for logs and audit records
    pub fn display_name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.filename)
    }

    pub fn display_mode(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request { kind: RequestKind, request: Request },
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: u16, message: String },
}

impl Packet {
    /// Decode one datagram payload
    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        if bytes.len() < OPCODE_LEN {
            return Err(TftpError::MalformedPacket(format!(
                "{} byte datagram has no opcode",
                bytes.len()
            )));
        }

        let mut buf = bytes;
        let opcode = Opcode::try_from(buf.get_u16())?;
        if !check_min_length(opcode, bytes.len()) {
            return Err(TftpError::MalformedPacket(format!(
                "{:?} packet of {} bytes is shorter than {}",
                opcode,
                bytes.len(),
                opcode.min_len()
            )));
        }

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let kind = if opcode == Opcode::Rrq {
                    RequestKind::Read
                } else {
                    RequestKind::Write
                };
                let request = parse_request(buf)?;
                Ok(Packet::Request { kind, request })
            }
            Opcode::Data => {
                let block = buf.get_u16();
                Ok(Packet::Data {
                    block,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            Opcode::Ack => Ok(Packet::Ack {
                block: buf.get_u16(),
            }),
            Opcode::Error => {
                let code = buf.get_u16();
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                Ok(Packet::Error {
                    code,
                    message: String::from_utf8_lossy(&buf[..end]).into_owned(),
                })
            }
        }
    }
}

/// Reject datagrams shorter than the minimum for their opcode
pub fn check_min_length(opcode: Opcode, size: usize) -> bool {
    size >= opcode.min_len()
}

/// Split an RRQ/WRQ body (everything after the opcode) into filename and mode
pub fn parse_request(body: &[u8]) -> Result<Request> {
    let name_end = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::MalformedPacket("filename is not terminated".to_string()))?;
    let rest = &body[name_end + 1..];
    let mode_end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::MalformedPacket("mode is not terminated".to_string()))?;

    Ok(Request {
        filename: Bytes::copy_from_slice(&body[..name_end]),
        mode: Bytes::copy_from_slice(&rest[..mode_end]),
    })
}

/// DATA packet; at most `max_len` bytes of `data` are written
pub fn encode_data(block: u16, data: &[u8], max_len: usize) -> BytesMut {
    let data = &data[..data.len().min(max_len)];
    let mut packet = BytesMut::with_capacity(OPCODE_LEN + BLOCK_LEN + data.len());
    packet.put_u16(Opcode::Data as u16);
    packet.put_u16(block);
    packet.put_slice(data);
    packet
}

pub fn encode_ack(block: u16) -> BytesMut {
    let mut packet = BytesMut::with_capacity(OPCODE_LEN + BLOCK_LEN);
    packet.put_u16(Opcode::Ack as u16);
    packet.put_u16(block);
    packet
}

/// ERROR packet carrying the fixed RFC 1350 message for `code`
pub fn encode_error(code: ErrorCode) -> BytesMut {
    let message = code.message();
    let mut packet = BytesMut::with_capacity(OPCODE_LEN + ERROR_CODE_LEN + message.len() + 1);
    packet.put_u16(Opcode::Error as u16);
    packet.put_u16(code.code());
    packet.put_slice(message.as_bytes());
    packet.put_u8(0);
    packet
}
