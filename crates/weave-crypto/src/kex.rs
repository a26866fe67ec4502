//! Ephemeral ECDH key exchange
//!
//! One ephemeral keypair is generated per prepared session on the curve the
//! handshake negotiated. Public keys travel as SEC1 uncompressed points.

use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};
use crate::suite::EllipticCurve;

/// Shared secret produced by completing an ECDH exchange
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: Vec<u8>,
}

enum KexSecret {
    P384(p384::ecdh::EphemeralSecret),
    P521(p521::ecdh::EphemeralSecret),
}

/// An ephemeral keypair bound to one negotiated curve
pub struct EphemeralKeyPair {
    curve: EllipticCurve,
    secret: KexSecret,
    public: Vec<u8>,
}

impl SharedSecret {
    /// The raw shared secret bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl EphemeralKeyPair {
    /// Generate a keypair on the given curve.
    ///
    /// Curves that are negotiable on the wire but unavailable for local key
    /// generation yield `UnsupportedCurve`.
    pub fn generate(curve: EllipticCurve) -> CryptoResult<Self> {
        match curve {
            EllipticCurve::Secp384r1 => {
                let secret = p384::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key().to_sec1_bytes().to_vec();
                Ok(Self {
                    curve,
                    secret: KexSecret::P384(secret),
                    public,
                })
            }
            EllipticCurve::Secp521r1 => {
                let secret = p521::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key().to_sec1_bytes().to_vec();
                Ok(Self {
                    curve,
                    secret: KexSecret::P521(secret),
                    public,
                })
            }
            EllipticCurve::Sect571k1 => Err(CryptoError::UnsupportedCurve("sect571k1")),
            EllipticCurve::Unsupported => Err(CryptoError::UnsupportedCurve("unsupported")),
        }
    }

    /// The curve this keypair lives on
    pub fn curve(&self) -> EllipticCurve {
        self.curve
    }

    /// The public point in SEC1 uncompressed encoding
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Complete the exchange against the peer's SEC1-encoded public point
    pub fn diffie_hellman(&self, peer_public: &[u8]) -> CryptoResult<SharedSecret> {
        match &self.secret {
            KexSecret::P384(secret) => {
                let peer = p384::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| CryptoError::InvalidPublicKey)?;
                let shared = secret.diffie_hellman(&peer);
                Ok(SharedSecret {
                    bytes: shared.raw_secret_bytes().to_vec(),
                })
            }
            KexSecret::P521(secret) => {
                let peer = p521::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| CryptoError::InvalidPublicKey)?;
                let shared = secret.diffie_hellman(&peer);
                Ok(SharedSecret {
                    bytes: shared.raw_secret_bytes().to_vec(),
                })
            }
        }
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EphemeralKeyPair({})", self.curve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p384_agreement() {
        let alice = EphemeralKeyPair::generate(EllipticCurve::Secp384r1).unwrap();
        let bob = EphemeralKeyPair::generate(EllipticCurve::Secp384r1).unwrap();

        let shared_a = alice.diffie_hellman(bob.public_key()).unwrap();
        let shared_b = bob.diffie_hellman(alice.public_key()).unwrap();

        assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());
    }

    #[test]
    fn test_p521_agreement() {
        let alice = EphemeralKeyPair::generate(EllipticCurve::Secp521r1).unwrap();
        let bob = EphemeralKeyPair::generate(EllipticCurve::Secp521r1).unwrap();

        let shared_a = alice.diffie_hellman(bob.public_key()).unwrap();
        let shared_b = bob.diffie_hellman(alice.public_key()).unwrap();

        assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());
    }

    #[test]
    fn test_sect571k1_unavailable() {
        assert!(matches!(
            EphemeralKeyPair::generate(EllipticCurve::Sect571k1),
            Err(CryptoError::UnsupportedCurve(_))
        ));
    }

    #[test]
    fn test_garbage_public_key_rejected() {
        let alice = EphemeralKeyPair::generate(EllipticCurve::Secp384r1).unwrap();

        assert!(alice.diffie_hellman(&[0x04, 0x01, 0x02]).is_err());
    }

    #[test]
    fn test_cross_curve_point_rejected() {
        let alice = EphemeralKeyPair::generate(EllipticCurve::Secp384r1).unwrap();
        let bob = EphemeralKeyPair::generate(EllipticCurve::Secp521r1).unwrap();

        assert!(alice.diffie_hellman(bob.public_key()).is_err());
    }
}
