//! Cipher suite and elliptic curve negotiation
//!
//! Both sides advertise an ordered capability list; the responder picks the
//! first entry of its own preference list that the peer also supports.

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// A negotiable cipher suite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CipherSuite {
    /// Placeholder for a suite the local build cannot use
    Unsupported = 0x00,
    EcdheRsaAes128GcmSha256 = 0x01,
    EcdheRsaAes256GcmSha384 = 0x02,
}

/// A negotiable elliptic curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EllipticCurve {
    /// Placeholder for a curve the local build cannot use
    Unsupported = 0x00,
    Sect571k1 = 0x01,
    Secp384r1 = 0x02,
    Secp521r1 = 0x03,
}

impl TryFrom<u8> for CipherSuite {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Unsupported),
            0x01 => Ok(Self::EcdheRsaAes128GcmSha256),
            0x02 => Ok(Self::EcdheRsaAes256GcmSha384),
            _ => Err(CryptoError::UnsupportedCipherSuite),
        }
    }
}

impl TryFrom<u8> for EllipticCurve {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Unsupported),
            0x01 => Ok(Self::Sect571k1),
            0x02 => Ok(Self::Secp384r1),
            0x03 => Ok(Self::Secp521r1),
            _ => Err(CryptoError::UnsupportedCurve("unknown curve value")),
        }
    }
}

impl CipherSuite {
    /// AEAD key size in bytes
    pub fn key_size(&self) -> usize {
        match self {
            Self::Unsupported => 0,
            Self::EcdheRsaAes128GcmSha256 => 16,
            Self::EcdheRsaAes256GcmSha384 => 32,
        }
    }

    /// Whether the local build can actually encrypt with this suite
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Unsupported)
    }

    /// Default preference order
    pub fn default_capabilities() -> Vec<CipherSuite> {
        vec![
            Self::EcdheRsaAes256GcmSha384,
            Self::EcdheRsaAes128GcmSha256,
        ]
    }
}

impl EllipticCurve {
    /// Whether the local build can generate keys on this curve
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Secp384r1 | Self::Secp521r1)
    }

    /// Default preference order
    pub fn default_capabilities() -> Vec<EllipticCurve> {
        vec![Self::Secp521r1, Self::Secp384r1]
    }
}

impl std::fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unsupported => "unsupported",
            Self::EcdheRsaAes128GcmSha256 => "ecdhe_rsa_aes128_gcm_sha256",
            Self::EcdheRsaAes256GcmSha384 => "ecdhe_rsa_aes256_gcm_sha384",
        };
        write!(f, "{}", name)
    }
}

impl std::fmt::Display for EllipticCurve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unsupported => "unsupported",
            Self::Sect571k1 => "sect571k1",
            Self::Secp384r1 => "secp384r1",
            Self::Secp521r1 => "secp521r1",
        };
        write!(f, "{}", name)
    }
}

/// Pick the first entry of `reference` that also appears in `capabilities`
/// and is usable by the local build.
pub fn first_common_cipher_suite(
    reference: &[CipherSuite],
    capabilities: &[CipherSuite],
) -> Option<CipherSuite> {
    reference
        .iter()
        .find(|cs| cs.is_usable() && capabilities.contains(cs))
        .copied()
}

/// Pick the first entry of `reference` that also appears in `capabilities`
/// and is usable by the local build.
pub fn first_common_elliptic_curve(
    reference: &[EllipticCurve],
    capabilities: &[EllipticCurve],
) -> Option<EllipticCurve> {
    reference
        .iter()
        .find(|ec| ec.is_usable() && capabilities.contains(ec))
        .copied()
}
