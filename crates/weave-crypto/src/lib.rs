//! Cryptographic primitives for the weave peer protocol
//!
//! This crate provides everything the FSCP handshake and data plane need:
//! - Ed25519 identities and opaque signature certificates
//! - Cipher suite / elliptic curve negotiation enums
//! - Ephemeral ECDH on the negotiated curve (P-384, P-521)
//! - Directional session key derivation (HKDF)
//! - AEAD frame sealing (AES-GCM, nonce = prefix ∥ sequence number)

pub mod aead;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod kex;
pub mod suite;

pub use aead::SessionKey;
pub use error::{CryptoError, CryptoResult};
pub use identity::{CertificateHash, Identity, Signature, SignatureCertificate};
pub use kdf::SessionKeyMaterial;
pub use kex::{EphemeralKeyPair, SharedSecret};
pub use suite::{
    first_common_cipher_suite, first_common_elliptic_curve, CipherSuite, EllipticCurve,
};

/// Re-export of commonly used types
pub mod prelude {
    pub use crate::aead::SessionKey;
    pub use crate::error::{CryptoError, CryptoResult};
    pub use crate::identity::{CertificateHash, Identity, Signature, SignatureCertificate};
    pub use crate::kdf::SessionKeyMaterial;
    pub use crate::kex::{EphemeralKeyPair, SharedSecret};
    pub use crate::suite::{CipherSuite, EllipticCurve};
}

/// Protocol constants
pub mod constants {
    /// Host identifier size in bytes
    pub const HOST_IDENTIFIER_SIZE: usize = 32;

    /// Per-direction AEAD nonce prefix size
    pub const NONCE_PREFIX_SIZE: usize = 8;

    /// Full AEAD nonce size (prefix plus 32-bit sequence number)
    pub const NONCE_SIZE: usize = 12;

    /// AEAD authentication tag size
    pub const AEAD_TAG_SIZE: usize = 16;

    /// Ed25519 signature size
    pub const SIGNATURE_SIZE: usize = 64;

    /// Ed25519 public key size
    pub const ED25519_PUBKEY_SIZE: usize = 32;

    /// Certificate hash size (BLAKE3 output)
    pub const CERT_HASH_SIZE: usize = 32;
}
