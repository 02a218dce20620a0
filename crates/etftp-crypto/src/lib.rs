//! Key agreement and per-block sealing for encrypted TFTP transfers.
//!
//! A transfer runs one ephemeral P-256 exchange ([`KeyExchange`]) during the
//! RRQ/OACK handshake. The resulting [`SessionKey`] drives a [`BlockCipher`]
//! that seals every DATA payload with AES-256-GCM.

pub mod cipher;
pub mod error;
pub mod keyx;

pub use cipher::{BlockCipher, NONCE_SIZE, SEAL_OVERHEAD, SealedBlock, TAG_SIZE, checksum};
pub use error::{AuthError, CipherError, CurveError};
pub use keyx::{COORDINATE_SIZE, KEY_SIZE, KeyExchange, PublicPoint, SessionKey};
