//! Certificate validation boundary
//!
//! Chain building, CA stores and CRL checking live outside the core; it
//! only holds a validator handle and asks yes or no. The user handler can
//! additionally veto whatever the validator decided.

use async_trait::async_trait;

use weave_crypto::SignatureCertificate;

/// Decides whether a presented certificate is trustworthy
#[async_trait]
pub trait CertificateValidator: Send + Sync {
    async fn validate(&self, certificate: &SignatureCertificate) -> bool;
}

/// Accepts every well-formed certificate (validation method `none`)
pub struct AcceptAllValidator;

#[async_trait]
impl CertificateValidator for AcceptAllValidator {
    async fn validate(&self, _certificate: &SignatureCertificate) -> bool {
        true
    }
}

/// Rejects everything; useful as a fail-closed placeholder
pub struct RejectAllValidator;

#[async_trait]
impl CertificateValidator for RejectAllValidator {
    async fn validate(&self, _certificate: &SignatureCertificate) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_crypto::Identity;

    #[tokio::test]
    async fn test_builtin_validators() {
        let identity = Identity::generate("node");
        let certificate = identity.certificate();

        assert!(AcceptAllValidator.validate(certificate).await);
        assert!(!RejectAllValidator.validate(certificate).await);
    }
}
