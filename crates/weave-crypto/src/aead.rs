//! Authenticated encryption of data frames
//!
//! The negotiated suite selects the AES-GCM variant. The 96-bit nonce is
//! the per-direction 8-byte prefix followed by the 32-bit big-endian frame
//! sequence number, so a (key, nonce) pair is unique as long as sequence
//! numbers never repeat within a session.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{AEAD_TAG_SIZE, NONCE_PREFIX_SIZE, NONCE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::suite::CipherSuite;

/// A directional session key sized for the negotiated suite
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: Vec<u8>,
}

impl SessionKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn full_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], sequence_number: u32) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&sequence_number.to_be_bytes());
    nonce
}

/// Encrypt a frame, returning ciphertext with the tag appended
pub fn seal(
    suite: CipherSuite,
    key: &SessionKey,
    nonce_prefix: &[u8; NONCE_PREFIX_SIZE],
    sequence_number: u32,
    plaintext: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    let nonce = full_nonce(nonce_prefix, sequence_number);
    let payload = Payload {
        msg: plaintext,
        aad,
    };

    match suite {
        CipherSuite::EcdheRsaAes128GcmSha256 => {
            let cipher = Aes128Gcm::new_from_slice(key.as_bytes())
                .map_err(|_| CryptoError::EncryptionFailed)?;
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                .map_err(|_| CryptoError::EncryptionFailed)
        }
        CipherSuite::EcdheRsaAes256GcmSha384 => {
            let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
                .map_err(|_| CryptoError::EncryptionFailed)?;
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                .map_err(|_| CryptoError::EncryptionFailed)
        }
        CipherSuite::Unsupported => Err(CryptoError::UnsupportedCipherSuite),
    }
}

/// Decrypt a frame whose ciphertext carries the tag at the end
pub fn open(
    suite: CipherSuite,
    key: &SessionKey,
    nonce_prefix: &[u8; NONCE_PREFIX_SIZE],
    sequence_number: u32,
    ciphertext: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() < AEAD_TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let nonce = full_nonce(nonce_prefix, sequence_number);
    let payload = Payload {
        msg: ciphertext,
        aad,
    };

    match suite {
        CipherSuite::EcdheRsaAes128GcmSha256 => {
            let cipher = Aes128Gcm::new_from_slice(key.as_bytes())
                .map_err(|_| CryptoError::DecryptionFailed)?;
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                .map_err(|_| CryptoError::DecryptionFailed)
        }
        CipherSuite::EcdheRsaAes256GcmSha384 => {
            let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
                .map_err(|_| CryptoError::DecryptionFailed)?;
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(&nonce), payload)
                .map_err(|_| CryptoError::DecryptionFailed)
        }
        CipherSuite::Unsupported => Err(CryptoError::UnsupportedCipherSuite),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_key(suite: CipherSuite) -> SessionKey {
        let mut bytes = vec![0u8; suite.key_size()];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        SessionKey::from_bytes(bytes)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        for suite in [
            CipherSuite::EcdheRsaAes128GcmSha256,
            CipherSuite::EcdheRsaAes256GcmSha384,
        ] {
            let key = random_key(suite);
            let prefix = [7u8; NONCE_PREFIX_SIZE];
            let aad = [3, 0x70, 0, 32, 0, 0, 0, 1];

            let sealed = seal(suite, &key, &prefix, 1, b"hello", &aad).unwrap();
            assert_eq!(sealed.len(), 5 + AEAD_TAG_SIZE);

            let opened = open(suite, &key, &prefix, 1, &sealed, &aad).unwrap();
            assert_eq!(opened, b"hello");
        }
    }

    #[test]
    fn test_wrong_sequence_number_fails() {
        let suite = CipherSuite::EcdheRsaAes128GcmSha256;
        let key = random_key(suite);
        let prefix = [1u8; NONCE_PREFIX_SIZE];

        let sealed = seal(suite, &key, &prefix, 5, b"frame", b"aad").unwrap();
        assert!(open(suite, &key, &prefix, 6, &sealed, b"aad").is_err());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let suite = CipherSuite::EcdheRsaAes256GcmSha384;
        let key = random_key(suite);
        let prefix = [2u8; NONCE_PREFIX_SIZE];

        let sealed = seal(suite, &key, &prefix, 9, b"frame", b"aad").unwrap();
        assert!(open(suite, &key, &prefix, 9, &sealed, b"other").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let suite = CipherSuite::EcdheRsaAes128GcmSha256;
        let key = random_key(suite);
        let prefix = [4u8; NONCE_PREFIX_SIZE];

        let mut sealed = seal(suite, &key, &prefix, 2, b"frame", b"aad").unwrap();
        sealed[0] ^= 0x01;
        assert!(open(suite, &key, &prefix, 2, &sealed, b"aad").is_err());
    }

    #[test]
    fn test_short_ciphertext_fails() {
        let suite = CipherSuite::EcdheRsaAes128GcmSha256;
        let key = random_key(suite);
        let prefix = [0u8; NONCE_PREFIX_SIZE];

        assert!(open(suite, &key, &prefix, 0, &[1, 2, 3], b"").is_err());
    }
}
