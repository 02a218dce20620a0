//! Ephemeral P-256 Diffie-Hellman.
//!
//! Each side generates one key pair per transfer and sends its public point
//! as two 32-byte big-endian coordinates. The session key is SHA-256 of the
//! x-coordinate of the shared point.

use std::fmt;

use p256::PublicKey;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CurveError;

/// Size of one affine coordinate on the wire.
pub const COORDINATE_SIZE: usize = 32;
/// AES-256 key size.
pub const KEY_SIZE: usize = 32;

const SEC1_UNCOMPRESSED: u8 = 0x04;

/// Affine coordinates of a P-256 public key, as exchanged in `keyx`/`keyy`.
///
/// Construction does not check that the point lies on the curve; that happens
/// in [`KeyExchange::derive_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicPoint {
    pub x: [u8; COORDINATE_SIZE],
    pub y: [u8; COORDINATE_SIZE],
}

impl PublicPoint {
    /// Build a point from big-endian coordinates, left-padding short ones.
    pub fn from_coordinates(x: &[u8], y: &[u8]) -> Result<Self, CurveError> {
        Ok(Self {
            x: pad_coordinate(x)?,
            y: pad_coordinate(y)?,
        })
    }

    /// Uncompressed SEC1 encoding: `04 || x || y`.
    pub fn to_sec1(&self) -> [u8; 1 + 2 * COORDINATE_SIZE] {
        let mut out = [0u8; 1 + 2 * COORDINATE_SIZE];
        out[0] = SEC1_UNCOMPRESSED;
        out[1..1 + COORDINATE_SIZE].copy_from_slice(&self.x);
        out[1 + COORDINATE_SIZE..].copy_from_slice(&self.y);
        out
    }
}

fn pad_coordinate(bytes: &[u8]) -> Result<[u8; COORDINATE_SIZE], CurveError> {
    if bytes.len() > COORDINATE_SIZE {
        return Err(CurveError::CoordinateTooLong { len: bytes.len() });
    }
    let mut out = [0u8; COORDINATE_SIZE];
    out[COORDINATE_SIZE - bytes.len()..].copy_from_slice(bytes);
    Ok(out)
}

/// One side of a key exchange. The secret scalar never leaves this struct.
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicPoint,
}

impl KeyExchange {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let encoded = secret.public_key().to_encoded_point(false);
        let bytes = encoded.as_bytes();

        let mut public = PublicPoint {
            x: [0u8; COORDINATE_SIZE],
            y: [0u8; COORDINATE_SIZE],
        };
        public.x.copy_from_slice(&bytes[1..1 + COORDINATE_SIZE]);
        public.y.copy_from_slice(&bytes[1 + COORDINATE_SIZE..]);

        Self { secret, public }
    }

    pub fn public_point(&self) -> PublicPoint {
        self.public
    }

    /// Validate the peer's point and derive the shared AES-256 key.
    pub fn derive_key(&self, peer: &PublicPoint) -> Result<SessionKey, CurveError> {
        let peer_key =
            PublicKey::from_sec1_bytes(&peer.to_sec1()).map_err(|_| CurveError::NotOnCurve)?;

        let shared = self.secret.diffie_hellman(&peer_key);
        let x = shared.raw_secret_bytes();
        if x.iter().all(|b| *b == 0) {
            return Err(CurveError::Degenerate);
        }

        let digest = Sha256::digest(x);
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest);
        Ok(SessionKey(key))
    }
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Symmetric key for one transfer. Wiped on drop; `Debug` prints only the
/// fingerprint.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// CRC32 of the key, safe to log for correlating both ends of a transfer.
    pub fn fingerprint(&self) -> u32 {
        crc32fast::hash(&self.0)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({:08x})", self.fingerprint())
    }
}
