use thiserror::Error;

/// Failure while validating a peer's public point or agreeing on a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CurveError {
    #[error("public key coordinate is {len} bytes, expected at most 32")]
    CoordinateTooLong { len: usize },
    #[error("public key coordinate is not valid hex")]
    MalformedCoordinate,
    #[error("invalid public key: point is not on P-256")]
    NotOnCurve,
    #[error("key agreement produced a degenerate shared secret")]
    Degenerate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("AES-GCM encryption failed")]
    Encrypt,
}

/// A sealed block that must not be accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("sealed block is {len} bytes, shorter than nonce and tag")]
    Truncated { len: usize },
    #[error("authentication tag mismatch")]
    TagMismatch,
    #[error("checksum mismatch: header says {expected:#010x}, plaintext hashes to {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}
