//! Node identity and signature certificates
//!
//! Each node owns a long-lived Ed25519 signing key wrapped in a signature
//! certificate. The certificate bytes are treated as opaque by the rest of
//! the stack: two peers are the same peer exactly when their certificate
//! bytes compare equal. Chain validation lives behind a pluggable validator
//! and is not performed here.

use ed25519_dalek::{Signature as Ed25519Sig, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::constants::{CERT_HASH_SIZE, ED25519_PUBKEY_SIZE, SIGNATURE_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// Leading bytes of every certificate encoding
const CERT_MAGIC: &[u8; 4] = b"WVC1";

/// Hash of a certificate's encoded bytes, used by contact discovery
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CertificateHash {
    bytes: [u8; CERT_HASH_SIZE],
}

/// A detached signature made with a node's signature key
#[derive(Clone, Copy)]
pub struct Signature {
    bytes: [u8; SIGNATURE_SIZE],
}

/// A signature certificate: opaque encoded bytes carrying a subject name
/// and the verifying key of the owner
#[derive(Clone, PartialEq, Eq)]
pub struct SignatureCertificate {
    der: Vec<u8>,
    subject: String,
    verifying_key: VerifyingKey,
}

/// A node's local identity: the signing key and its certificate
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    certificate: SignatureCertificate,
}

/// Signing key material kept zeroized on drop
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyBytes(pub [u8; 32]);

impl CertificateHash {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; CERT_HASH_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != CERT_HASH_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: CERT_HASH_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; CERT_HASH_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; CERT_HASH_SIZE] {
        &self.bytes
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse from hex string
    pub fn from_hex(hex: &str) -> CryptoResult<Self> {
        if hex.len() != CERT_HASH_SIZE * 2 {
            return Err(CryptoError::InvalidKeyLength {
                expected: CERT_HASH_SIZE * 2,
                actual: hex.len(),
            });
        }
        let mut bytes = [0u8; CERT_HASH_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| CryptoError::MalformedCertificate("invalid hex digit".into()))?;
        }
        Ok(Self { bytes })
    }
}

impl std::fmt::Debug for CertificateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CertificateHash({})", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for CertificateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignature);
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({:02x}{:02x}..)", self.bytes[0], self.bytes[1])
    }
}

impl SignatureCertificate {
    /// Parse a certificate from its encoded bytes.
    ///
    /// The self-signature embedded at the end is checked so a corrupted
    /// certificate is rejected before it enters any store.
    pub fn from_der(der: &[u8]) -> CryptoResult<Self> {
        if der.len() < CERT_MAGIC.len() + 2 {
            return Err(CryptoError::MalformedCertificate("truncated".into()));
        }
        if &der[..4] != CERT_MAGIC {
            return Err(CryptoError::MalformedCertificate("bad magic".into()));
        }

        let subject_len = u16::from_be_bytes([der[4], der[5]]) as usize;
        let expected = 4 + 2 + subject_len + ED25519_PUBKEY_SIZE + SIGNATURE_SIZE;
        if der.len() != expected {
            return Err(CryptoError::MalformedCertificate(format!(
                "length mismatch: expected {}, got {}",
                expected,
                der.len()
            )));
        }

        let subject = std::str::from_utf8(&der[6..6 + subject_len])
            .map_err(|_| CryptoError::MalformedCertificate("subject is not UTF-8".into()))?
            .to_string();

        let key_start = 6 + subject_len;
        let mut key_bytes = [0u8; ED25519_PUBKEY_SIZE];
        key_bytes.copy_from_slice(&der[key_start..key_start + ED25519_PUBKEY_SIZE]);
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidPublicKey)?;

        let sig_start = key_start + ED25519_PUBKEY_SIZE;
        let mut sig_bytes = [0u8; SIGNATURE_SIZE];
        sig_bytes.copy_from_slice(&der[sig_start..]);
        let signature = Ed25519Sig::from_bytes(&sig_bytes);

        verifying_key
            .verify(&der[..sig_start], &signature)
            .map_err(|_| CryptoError::MalformedCertificate("self-signature mismatch".into()))?;

        Ok(Self {
            der: der.to_vec(),
            subject,
            verifying_key,
        })
    }

    /// The encoded certificate bytes
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// The certificate's subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Hash of the encoded bytes
    pub fn hash(&self) -> CertificateHash {
        let digest = blake3::hash(&self.der);
        CertificateHash::from_bytes(*digest.as_bytes())
    }

    /// Verify a detached signature made by the certificate's owner
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let sig = Ed25519Sig::from_bytes(&signature.bytes);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl std::fmt::Debug for SignatureCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignatureCertificate({})", self.subject)
    }
}

impl Identity {
    /// Generate a fresh identity with a self-signed certificate
    pub fn generate(subject: &str) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let certificate = Self::make_certificate(&signing_key, subject);
        Self {
            signing_key,
            certificate,
        }
    }

    /// Rebuild an identity from stored key bytes
    pub fn from_key_bytes(key: &SigningKeyBytes, subject: &str) -> Self {
        let signing_key = SigningKey::from_bytes(&key.0);
        let certificate = Self::make_certificate(&signing_key, subject);
        Self {
            signing_key,
            certificate,
        }
    }

    fn make_certificate(signing_key: &SigningKey, subject: &str) -> SignatureCertificate {
        let mut der = Vec::with_capacity(
            CERT_MAGIC.len() + 2 + subject.len() + ED25519_PUBKEY_SIZE + SIGNATURE_SIZE,
        );
        der.extend_from_slice(CERT_MAGIC);
        der.extend_from_slice(&(subject.len() as u16).to_be_bytes());
        der.extend_from_slice(subject.as_bytes());
        der.extend_from_slice(signing_key.verifying_key().as_bytes());
        let signature = signing_key.sign(&der);
        der.extend_from_slice(&signature.to_bytes());

        SignatureCertificate {
            der,
            subject: subject.to_string(),
            verifying_key: signing_key.verifying_key(),
        }
    }

    /// The local signature certificate
    pub fn certificate(&self) -> &SignatureCertificate {
        &self.certificate
    }

    /// Sign a message with the signature key
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.signing_key.sign(message).to_bytes())
    }

    /// Export the signing key bytes for secure storage
    pub fn export_key_bytes(&self) -> SigningKeyBytes {
        SigningKeyBytes(self.signing_key.to_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.certificate.subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certificate_roundtrip() {
        let identity = Identity::generate("alice");
        let der = identity.certificate().der().to_vec();

        let parsed = SignatureCertificate::from_der(&der).unwrap();
        assert_eq!(parsed.subject(), "alice");
        assert_eq!(parsed.der(), &der[..]);
        assert_eq!(parsed.hash(), identity.certificate().hash());
    }

    #[test]
    fn test_corrupted_certificate_rejected() {
        let identity = Identity::generate("bob");
        let mut der = identity.certificate().der().to_vec();
        let last = der.len() - 1;
        der[last] ^= 0xFF;

        assert!(SignatureCertificate::from_der(&der).is_err());
    }

    #[test]
    fn test_truncated_certificate_rejected() {
        let identity = Identity::generate("carol");
        let der = identity.certificate().der();

        assert!(SignatureCertificate::from_der(&der[..der.len() - 3]).is_err());
        assert!(SignatureCertificate::from_der(&[]).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let identity = Identity::generate("alice");
        let message = b"session request payload";
        let signature = identity.sign(message);

        assert!(identity.certificate().verify(message, &signature).is_ok());
        assert!(identity
            .certificate()
            .verify(b"another message", &signature)
            .is_err());
    }

    #[test]
    fn test_signature_from_other_key_rejected() {
        let alice = Identity::generate("alice");
        let mallory = Identity::generate("mallory");

        let message = b"payload";
        let forged = mallory.sign(message);

        assert!(alice.certificate().verify(message, &forged).is_err());
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let identity = Identity::generate("alice");
        let hash = identity.certificate().hash();

        let hex = hash.to_hex();
        assert_eq!(CertificateHash::from_hex(&hex).unwrap(), hash);
        assert!(CertificateHash::from_hex("zz").is_err());
    }

    #[test]
    fn test_identities_differ() {
        let a = Identity::generate("node");
        let b = Identity::generate("node");

        // Same subject, different keys: different certificates.
        assert_ne!(a.certificate().der(), b.certificate().der());
        assert_ne!(a.certificate().hash(), b.certificate().hash());
    }
}
