//! Datagram formats.
//!
//! ```text
//! RRQ / WRQ  [0..2] opcode  filename\0 mode\0 (name\0 value\0)*
//! DATA       [0..2] opcode  [2..4] block  [4..8] crc32  [8..] sealed payload
//! ACK        [0..2] opcode  [2..4] block
//! ERROR      [0..2] opcode  [2..4] code   [4..] message
//! OACK       [0..2] opcode  (name\0 value\0)*
//! TERM       [0..2] opcode
//! ```
//!
//! All integers are big-endian. The DATA payload is nonce + ciphertext + tag
//! and the crc32 covers the plaintext.

use std::fmt;

use crate::error::ParseError;
use crate::options::{Options, split_cstr};

/// Opcode field size.
pub const OPCODE_SIZE: usize = 2;

/// ACK is opcode + block.
pub const ACK_SIZE: usize = 4;

/// ERROR header: opcode + code. The message may be empty.
pub const ERROR_HEADER: usize = 4;

/// DATA header: opcode + block + crc32.
pub const DATA_HEADER: usize = 8;

/// Largest datagram either side reads.
pub const MAX_DATAGRAM: usize = 65_536;

/// The only transfer modes accepted in a request.
pub const MODES: [&str; 2] = ["octet", "netascii"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
    Terminate = 8,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Rrq => "RRQ",
            Opcode::Wrq => "WRQ",
            Opcode::Data => "DATA",
            Opcode::Ack => "ACK",
            Opcode::Error => "ERROR",
            Opcode::Oack => "OACK",
            Opcode::Terminate => "TERM",
        }
    }

    fn min_size(self) -> usize {
        match self {
            Opcode::Data => DATA_HEADER,
            Opcode::Ack => ACK_SIZE,
            Opcode::Error => ERROR_HEADER,
            // filename\0 mode\0 with both at least one byte
            Opcode::Rrq | Opcode::Wrq => OPCODE_SIZE + 4,
            Opcode::Oack | Opcode::Terminate => OPCODE_SIZE,
        }
    }
}

impl TryFrom<u16> for Opcode {
    type Error = ParseError;

    fn try_from(value: u16) -> Result<Self, ParseError> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            8 => Ok(Opcode::Terminate),
            other => Err(ParseError::UnknownOpcode(other)),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// Codes carried in ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    IllegalOperation = 4,
    UnknownTid = 5,
    OptionNegotiation = 8,
    Aborted = 9,
    KeyExchange = 11,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request {
        kind: RequestKind,
        filename: String,
        mode: String,
        options: Options,
    },
    Data {
        block: u16,
        checksum: u32,
        payload: Vec<u8>,
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: Vec<u8>,
    },
    OptionAck {
        options: Options,
    },
    Terminate,
}

impl Packet {
    /// Octet-mode read request.
    pub fn read_request(filename: impl Into<String>, options: Options) -> Self {
        Packet::Request {
            kind: RequestKind::Read,
            filename: filename.into(),
            mode: "octet".into(),
            options,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code: code.code(),
            message: message.into().into_bytes(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Request { kind: RequestKind::Read, .. } => Opcode::Rrq,
            Packet::Request { kind: RequestKind::Write, .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::OptionAck { .. } => Opcode::Oack,
            Packet::Terminate => Opcode::Terminate,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len_hint());
        buf.extend_from_slice(&(self.opcode() as u16).to_be_bytes());

        match self {
            Packet::Request { filename, mode, options, .. } => {
                buf.extend_from_slice(filename.as_bytes());
                buf.push(0);
                buf.extend_from_slice(mode.as_bytes());
                buf.push(0);
                options.encode_into(&mut buf);
            }
            Packet::Data { block, checksum, payload } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(&checksum.to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(message);
            }
            Packet::OptionAck { options } => options.encode_into(&mut buf),
            Packet::Terminate => {}
        }
        buf
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            Packet::Data { payload, .. } => DATA_HEADER + payload.len(),
            Packet::Error { message, .. } => ERROR_HEADER + message.len(),
            _ => 64,
        }
    }

    /// Opcode of a raw datagram without decoding the rest.
    pub fn peek_opcode(buf: &[u8]) -> Result<Opcode, ParseError> {
        if buf.len() < OPCODE_SIZE {
            return Err(ParseError::TooShort {
                kind: "any",
                len: buf.len(),
                min: OPCODE_SIZE,
            });
        }
        Opcode::try_from(u16::from_be_bytes([buf[0], buf[1]]))
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let opcode = Self::peek_opcode(buf)?;
        if buf.len() < opcode.min_size() {
            return Err(ParseError::TooShort {
                kind: opcode.name(),
                len: buf.len(),
                min: opcode.min_size(),
            });
        }

        let body = &buf[OPCODE_SIZE..];
        match opcode {
            Opcode::Rrq => decode_request(RequestKind::Read, body),
            Opcode::Wrq => decode_request(RequestKind::Write, body),
            Opcode::Data => Ok(Packet::Data {
                block: u16::from_be_bytes([body[0], body[1]]),
                checksum: u32::from_be_bytes([body[2], body[3], body[4], body[5]]),
                payload: body[6..].to_vec(),
            }),
            Opcode::Ack => Ok(Packet::Ack {
                block: u16::from_be_bytes([body[0], body[1]]),
            }),
            Opcode::Error => Ok(Packet::Error {
                code: u16::from_be_bytes([body[0], body[1]]),
                message: trim_nul(&body[2..]).to_vec(),
            }),
            Opcode::Oack => Ok(Packet::OptionAck {
                options: Options::decode(body)?,
            }),
            Opcode::Terminate => Ok(Packet::Terminate),
        }
    }

    /// Decode a datagram that must carry `expected`.
    pub fn decode_expecting(buf: &[u8], expected: Opcode) -> Result<Self, ParseError> {
        let found = Self::peek_opcode(buf)?;
        if found != expected {
            return Err(ParseError::UnexpectedOpcode { expected, found });
        }
        Self::decode(buf)
    }
}

fn decode_request(kind: RequestKind, body: &[u8]) -> Result<Packet, ParseError> {
    let (filename, rest) = split_cstr(body, "filename")?;
    let (mode, rest) = split_cstr(rest, "mode")?;

    let filename = std::str::from_utf8(filename).map_err(|_| ParseError::InvalidUtf8("filename"))?;
    if filename.is_empty() {
        return Err(ParseError::EmptyFilename);
    }
    let mode = std::str::from_utf8(mode).map_err(|_| ParseError::InvalidUtf8("mode"))?;

    Ok(Packet::Request {
        kind,
        filename: filename.to_string(),
        mode: mode.to_ascii_lowercase(),
        options: Options::decode(rest)?,
    })
}

/// Classic TFTP peers terminate the error message with a NUL.
fn trim_nul(message: &[u8]) -> &[u8] {
    match message.iter().position(|b| *b == 0) {
        Some(end) => &message[..end],
        None => message,
    }
}
