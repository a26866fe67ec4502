//! Session key derivation
//!
//! Both peers feed the same ECDH shared secret, the same pair of public
//! points and the two host identifiers into HKDF. Directions are labelled
//! by the host identifier of the *sending* side, so the material comes out
//! mirrored: A's local key equals B's remote key and vice versa.

use hkdf::Hkdf;
use sha2::{Sha256, Sha384};

use crate::aead::SessionKey;
use crate::constants::{HOST_IDENTIFIER_SIZE, NONCE_PREFIX_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::kex::SharedSecret;
use crate::suite::CipherSuite;

/// The four pieces of directional material derived for one session
pub struct SessionKeyMaterial {
    pub local_key: SessionKey,
    pub remote_key: SessionKey,
    pub local_nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    pub remote_nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

fn direction_info(label: &[u8], direction: &[u8; HOST_IDENTIFIER_SIZE]) -> Vec<u8> {
    let mut info = Vec::with_capacity(label.len() + HOST_IDENTIFIER_SIZE);
    info.extend_from_slice(label);
    info.extend_from_slice(direction);
    info
}

/// Derive the directional session material.
///
/// `local_public`/`remote_public` are the two SEC1 points exchanged in the
/// SESSION messages; they are ordered canonically before being mixed in so
/// both sides compute the same salt.
pub fn derive_session_material(
    suite: CipherSuite,
    shared: &SharedSecret,
    local_public: &[u8],
    remote_public: &[u8],
    local_host_identifier: &[u8; HOST_IDENTIFIER_SIZE],
    remote_host_identifier: &[u8; HOST_IDENTIFIER_SIZE],
) -> CryptoResult<SessionKeyMaterial> {
    let key_size = suite.key_size();
    if key_size == 0 {
        return Err(CryptoError::UnsupportedCipherSuite);
    }

    // Canonical ordering keeps the salt identical on both sides.
    let (lo, hi) = if local_public <= remote_public {
        (local_public, remote_public)
    } else {
        (remote_public, local_public)
    };
    let mut salt = Vec::with_capacity(lo.len() + hi.len());
    salt.extend_from_slice(lo);
    salt.extend_from_slice(hi);

    let mut local_key = vec![0u8; key_size];
    let mut remote_key = vec![0u8; key_size];
    let mut local_nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
    let mut remote_nonce_prefix = [0u8; NONCE_PREFIX_SIZE];

    macro_rules! expand_all {
        ($hkdf:expr) => {{
            let hkdf = $hkdf;
            hkdf.expand(
                &direction_info(b"fscp-key", local_host_identifier),
                &mut local_key,
            )
            .map_err(|_| CryptoError::DerivationFailed)?;
            hkdf.expand(
                &direction_info(b"fscp-key", remote_host_identifier),
                &mut remote_key,
            )
            .map_err(|_| CryptoError::DerivationFailed)?;
            hkdf.expand(
                &direction_info(b"fscp-nonce", local_host_identifier),
                &mut local_nonce_prefix,
            )
            .map_err(|_| CryptoError::DerivationFailed)?;
            hkdf.expand(
                &direction_info(b"fscp-nonce", remote_host_identifier),
                &mut remote_nonce_prefix,
            )
            .map_err(|_| CryptoError::DerivationFailed)?;
        }};
    }

    match suite {
        CipherSuite::EcdheRsaAes128GcmSha256 => {
            expand_all!(Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes()))
        }
        CipherSuite::EcdheRsaAes256GcmSha384 => {
            expand_all!(Hkdf::<Sha384>::new(Some(&salt), shared.as_bytes()))
        }
        CipherSuite::Unsupported => return Err(CryptoError::UnsupportedCipherSuite),
    }

    Ok(SessionKeyMaterial {
        local_key: SessionKey::from_bytes(local_key),
        remote_key: SessionKey::from_bytes(remote_key),
        local_nonce_prefix,
        remote_nonce_prefix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kex::EphemeralKeyPair;
    use crate::suite::EllipticCurve;
    use rand::RngCore;

    fn random_host_identifier() -> [u8; HOST_IDENTIFIER_SIZE] {
        let mut id = [0u8; HOST_IDENTIFIER_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut id);
        id
    }

    #[test]
    fn test_material_is_mirrored() {
        let suite = CipherSuite::EcdheRsaAes128GcmSha256;
        let alice = EphemeralKeyPair::generate(EllipticCurve::Secp384r1).unwrap();
        let bob = EphemeralKeyPair::generate(EllipticCurve::Secp384r1).unwrap();
        let alice_id = random_host_identifier();
        let bob_id = random_host_identifier();

        let shared_a = alice.diffie_hellman(bob.public_key()).unwrap();
        let shared_b = bob.diffie_hellman(alice.public_key()).unwrap();

        let material_a = derive_session_material(
            suite,
            &shared_a,
            alice.public_key(),
            bob.public_key(),
            &alice_id,
            &bob_id,
        )
        .unwrap();
        let material_b = derive_session_material(
            suite,
            &shared_b,
            bob.public_key(),
            alice.public_key(),
            &bob_id,
            &alice_id,
        )
        .unwrap();

        assert_eq!(
            material_a.local_key.as_bytes(),
            material_b.remote_key.as_bytes()
        );
        assert_eq!(
            material_a.remote_key.as_bytes(),
            material_b.local_key.as_bytes()
        );
        assert_eq!(material_a.local_nonce_prefix, material_b.remote_nonce_prefix);
        assert_eq!(material_a.remote_nonce_prefix, material_b.local_nonce_prefix);
    }

    #[test]
    fn test_directions_differ() {
        let suite = CipherSuite::EcdheRsaAes256GcmSha384;
        let alice = EphemeralKeyPair::generate(EllipticCurve::Secp521r1).unwrap();
        let bob = EphemeralKeyPair::generate(EllipticCurve::Secp521r1).unwrap();
        let alice_id = random_host_identifier();
        let bob_id = random_host_identifier();

        let shared = alice.diffie_hellman(bob.public_key()).unwrap();
        let material = derive_session_material(
            suite,
            &shared,
            alice.public_key(),
            bob.public_key(),
            &alice_id,
            &bob_id,
        )
        .unwrap();

        assert_ne!(material.local_key.as_bytes(), material.remote_key.as_bytes());
        assert_ne!(material.local_nonce_prefix, material.remote_nonce_prefix);
        assert_eq!(material.local_key.as_bytes().len(), 32);
    }

    #[test]
    fn test_end_to_end_frame_between_derived_keys() {
        let suite = CipherSuite::EcdheRsaAes128GcmSha256;
        let alice = EphemeralKeyPair::generate(EllipticCurve::Secp384r1).unwrap();
        let bob = EphemeralKeyPair::generate(EllipticCurve::Secp384r1).unwrap();
        let alice_id = random_host_identifier();
        let bob_id = random_host_identifier();

        let material_a = derive_session_material(
            suite,
            &alice.diffie_hellman(bob.public_key()).unwrap(),
            alice.public_key(),
            bob.public_key(),
            &alice_id,
            &bob_id,
        )
        .unwrap();
        let material_b = derive_session_material(
            suite,
            &bob.diffie_hellman(alice.public_key()).unwrap(),
            bob.public_key(),
            alice.public_key(),
            &bob_id,
            &alice_id,
        )
        .unwrap();

        // Alice seals with her local material, Bob opens with his remote one.
        let sealed = crate::aead::seal(
            suite,
            &material_a.local_key,
            &material_a.local_nonce_prefix,
            1,
            b"hello",
            b"aad",
        )
        .unwrap();
        let opened = crate::aead::open(
            suite,
            &material_b.remote_key,
            &material_b.remote_nonce_prefix,
            1,
            &sealed,
            b"aad",
        )
        .unwrap();

        assert_eq!(opened, b"hello");
    }
}
