//! Cryptographic errors

use thiserror::Error;

/// Errors produced by the cryptographic primitives
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid public key encoding
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Signature verification failed
    #[error("Signature verification failed")]
    InvalidSignature,

    /// The elliptic curve is not available for key generation
    #[error("Unsupported elliptic curve: {0}")]
    UnsupportedCurve(&'static str),

    /// The cipher suite is not available
    #[error("Unsupported cipher suite")]
    UnsupportedCipherSuite,

    /// AEAD encryption failed
    #[error("Encryption failed")]
    EncryptionFailed,

    /// AEAD decryption or authentication failed
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Malformed certificate bytes
    #[error("Malformed certificate: {0}")]
    MalformedCertificate(String),

    /// Key derivation failed
    #[error("Key derivation failed")]
    DerivationFailed,
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
