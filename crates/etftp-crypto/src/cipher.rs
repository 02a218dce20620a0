//! AES-256-GCM sealing for DATA payloads.
//!
//! Sealed format: nonce(12) + ciphertext + tag(16)
//!
//! Every call draws a fresh random nonce, so a retransmitted block is sealed
//! again rather than replayed byte-for-byte.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::{AuthError, CipherError};
use crate::keyx::SessionKey;

pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
/// Bytes added to every plaintext by [`BlockCipher::seal`].
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// CRC32 (IEEE) carried in the DATA header.
pub fn checksum(plaintext: &[u8]) -> u32 {
    crc32fast::hash(plaintext)
}

/// A sealed block together with the checksum of its plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlock {
    pub checksum: u32,
    pub sealed: Vec<u8>,
}

/// Per-transfer cipher context.
pub struct BlockCipher {
    cipher: Aes256Gcm,
}

impl BlockCipher {
    pub fn new(key: &SessionKey) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        BlockCipher { cipher }
    }

    /// Encrypt a plaintext block. Returns nonce + ciphertext + tag.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt and authenticate a sealed block.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, AuthError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(AuthError::Truncated { len: sealed.len() });
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AuthError::TagMismatch)
    }

    pub fn seal_block(&self, plaintext: &[u8]) -> Result<SealedBlock, CipherError> {
        Ok(SealedBlock {
            checksum: checksum(plaintext),
            sealed: self.seal(plaintext)?,
        })
    }

    /// Open a sealed block and check it against the header checksum.
    pub fn open_block(&self, sealed: &[u8], expected: u32) -> Result<Vec<u8>, AuthError> {
        let plaintext = self.open(sealed)?;
        let actual = checksum(&plaintext);
        if actual != expected {
            return Err(AuthError::ChecksumMismatch { expected, actual });
        }
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyx::KEY_SIZE;

    fn test_cipher(byte: u8) -> BlockCipher {
        BlockCipher::new(&SessionKey::from_bytes([byte; KEY_SIZE]))
    }

    #[test]
    fn seal_open_roundtrip() {
        let cipher = test_cipher(0x42);
        let plaintext = b"Hello, encrypted TFTP!";

        let sealed = cipher.seal(plaintext).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + SEAL_OVERHEAD);

        let opened = cipher.open(&sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn empty_block_roundtrip() {
        let cipher = test_cipher(0x42);
        let sealed = cipher.seal(&[]).unwrap();
        assert_eq!(sealed.len(), SEAL_OVERHEAD);
        assert!(cipher.open(&sealed).unwrap().is_empty());
    }

    #[test]
    fn nonces_are_fresh() {
        let cipher = test_cipher(0x42);
        let a = cipher.seal(b"same block").unwrap();
        let b = cipher.seal(b"same block").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_data_fails() {
        let cipher = test_cipher(0x42);
        let sealed = cipher.seal(b"secret data").unwrap();

        // Nonce, ciphertext body and tag are all covered.
        for index in [0, NONCE_SIZE + 2, sealed.len() - 1] {
            let mut tampered = sealed.clone();
            tampered[index] ^= 0xFF;
            assert_eq!(cipher.open(&tampered), Err(AuthError::TagMismatch));
        }
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = test_cipher(0x42).seal(b"secret data").unwrap();
        assert_eq!(test_cipher(0x43).open(&sealed), Err(AuthError::TagMismatch));
    }

    #[test]
    fn truncated_input_fails() {
        let cipher = test_cipher(0x42);
        assert_eq!(
            cipher.open(&[0u8; SEAL_OVERHEAD - 1]),
            Err(AuthError::Truncated { len: SEAL_OVERHEAD - 1 })
        );
    }

    #[test]
    fn sealed_block_checks_checksum() {
        let cipher = test_cipher(0x42);
        let block = cipher.seal_block(b"block payload").unwrap();
        assert_eq!(block.checksum, checksum(b"block payload"));
        assert_eq!(
            cipher.open_block(&block.sealed, block.checksum).unwrap(),
            b"block payload"
        );

        let err = cipher.open_block(&block.sealed, block.checksum ^ 1).unwrap_err();
        assert!(matches!(err, AuthError::ChecksumMismatch { .. }));
    }

    #[test]
    fn checksum_is_crc32_ieee() {
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
    }
}
