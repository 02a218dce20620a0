use std::io;

use etftp_crypto::{AuthError, CipherError, CurveError};
use thiserror::Error;

use crate::backoff::RetryExhausted;
use crate::packet::{ErrorCode, Opcode};
use crate::source::SourceError;

/// A datagram that does not decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{kind} packet is {len} bytes, need at least {min}")]
    TooShort {
        kind: &'static str,
        len: usize,
        min: usize,
    },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("expected {expected} packet, got {found}")]
    UnexpectedOpcode { expected: Opcode, found: Opcode },
    #[error("{0} is not NUL-terminated")]
    Unterminated(&'static str),
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("request filename is empty")]
    EmptyFilename,
    #[error("option name is empty")]
    EmptyOptionName,
}

/// Why a transfer did not complete.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("malformed packet: {0}")]
    Parse(#[from] ParseError),
    #[error("handshake failed: {0}")]
    Curve(#[from] CurveError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("option negotiation failed: {0}")]
    Negotiation(String),
    #[error("transfer aborted: {0}")]
    Auth(#[from] AuthError),
    #[error("encryption failed: {0}")]
    Cipher(#[from] CipherError),
    #[error("transfer aborted: exceeded retry limit after {timeouts} consecutive timeouts")]
    RetryExhausted { timeouts: u32 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("payload source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("peer reported error {code}: {message}")]
    Peer { code: u16, message: String },
    #[error("peer terminated the transfer")]
    Terminated,
    #[error("transfer size mismatch: announced {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Map an ERROR packet from the peer. File-not-found becomes
    /// [`TransferError::NotFound`]; everything else stays a peer error.
    pub fn from_peer(code: u16, message: &[u8]) -> Self {
        let message = String::from_utf8_lossy(message).into_owned();
        if code == ErrorCode::FileNotFound.code() {
            TransferError::NotFound(message)
        } else {
            TransferError::Peer { code, message }
        }
    }

    /// Error code to report to the peer when this side gives up.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransferError::Parse(_) => ErrorCode::IllegalOperation,
            TransferError::Curve(_) | TransferError::Handshake(_) => ErrorCode::KeyExchange,
            TransferError::Negotiation(_) => ErrorCode::OptionNegotiation,
            TransferError::NotFound(_) => ErrorCode::FileNotFound,
            TransferError::Auth(_) | TransferError::RetryExhausted { .. } => ErrorCode::Aborted,
            _ => ErrorCode::NotDefined,
        }
    }
}

impl From<RetryExhausted> for TransferError {
    fn from(err: RetryExhausted) -> Self {
        TransferError::RetryExhausted {
            timeouts: err.timeouts,
        }
    }
}

impl From<SourceError> for TransferError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotFound(name) => TransferError::NotFound(name),
            SourceError::Unavailable(reason) => TransferError::SourceUnavailable(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_not_found_maps_to_not_found() {
        let err = TransferError::from_peer(1, b"file not found");
        assert!(matches!(err, TransferError::NotFound(ref m) if m == "file not found"));
    }

    #[test]
    fn other_codes_stay_peer_errors() {
        let err = TransferError::from_peer(9, b"transfer aborted");
        assert!(matches!(err, TransferError::Peer { code: 9, .. }));
    }

    #[test]
    fn curve_errors_read_as_handshake_failures() {
        let err = TransferError::from(CurveError::NotOnCurve);
        assert!(err.to_string().starts_with("handshake failed: invalid public key"));
        assert_eq!(err.error_code(), ErrorCode::KeyExchange);
    }
}
