//! Identity and presentation store
//!
//! Remembers the signature certificate last presented by each remote
//! endpoint, and holds the local identity. All mutation goes through this
//! store's locks so readers observe consistent state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;

use weave_crypto::{CertificateHash, Identity, SignatureCertificate};

/// How an inbound PRESENTATION relates to what the store remembers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationStatus {
    /// First certificate seen from this endpoint
    First,
    /// Same certificate as the remembered one
    Same,
    /// A different certificate than the remembered one
    New,
}

/// The local identity plus the per-endpoint certificate memory
pub struct PresentationStore {
    local: RwLock<Arc<Identity>>,
    remote: RwLock<HashMap<SocketAddr, SignatureCertificate>>,
}

impl PresentationStore {
    /// Create a store around the local identity
    pub fn new(identity: Identity) -> Self {
        Self {
            local: RwLock::new(Arc::new(identity)),
            remote: RwLock::new(HashMap::new()),
        }
    }

    /// The current local identity
    pub async fn local_identity(&self) -> Arc<Identity> {
        self.local.read().await.clone()
    }

    /// Swap the local identity atomically
    pub async fn set_local_identity(&self, identity: Identity) {
        *self.local.write().await = Arc::new(identity);
    }

    /// Classify a certificate against what is remembered for the endpoint
    pub async fn status_of(
        &self,
        endpoint: SocketAddr,
        certificate: &SignatureCertificate,
    ) -> PresentationStatus {
        match self.remote.read().await.get(&endpoint) {
            None => PresentationStatus::First,
            Some(known) if known.der() == certificate.der() => PresentationStatus::Same,
            Some(_) => PresentationStatus::New,
        }
    }

    /// The remembered certificate for an endpoint
    pub async fn get_presentation(&self, endpoint: SocketAddr) -> Option<SignatureCertificate> {
        self.remote.read().await.get(&endpoint).cloned()
    }

    /// Remember a certificate for an endpoint
    pub async fn set_presentation(&self, endpoint: SocketAddr, certificate: SignatureCertificate) {
        self.remote.write().await.insert(endpoint, certificate);
    }

    /// Forget the certificate remembered for an endpoint
    pub async fn clear_presentation(&self, endpoint: SocketAddr) {
        self.remote.write().await.remove(&endpoint);
    }

    /// Every endpoint with a remembered certificate
    pub async fn endpoints(&self) -> Vec<SocketAddr> {
        self.remote.read().await.keys().copied().collect()
    }

    /// Find endpoints whose remembered certificate matches a hash
    pub async fn find_by_hash(
        &self,
        hash: &CertificateHash,
    ) -> Vec<(SocketAddr, SignatureCertificate)> {
        self.remote
            .read()
            .await
            .iter()
            .filter(|(_, cert)| cert.hash() == *hash)
            .map(|(ep, cert)| (*ep, cert.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> SocketAddr {
        format!("192.0.2.1:{}", port).parse().unwrap()
    }

    #[tokio::test]
    async fn test_presentation_lifecycle() {
        let store = PresentationStore::new(Identity::generate("local"));
        let peer = Identity::generate("peer");
        let ep = endpoint(12000);

        assert_eq!(
            store.status_of(ep, peer.certificate()).await,
            PresentationStatus::First
        );
        assert!(store.get_presentation(ep).await.is_none());

        store.set_presentation(ep, peer.certificate().clone()).await;
        assert_eq!(
            store.status_of(ep, peer.certificate()).await,
            PresentationStatus::Same
        );
        assert_eq!(
            store.get_presentation(ep).await.unwrap().der(),
            peer.certificate().der()
        );

        let other = Identity::generate("other");
        assert_eq!(
            store.status_of(ep, other.certificate()).await,
            PresentationStatus::New
        );

        store.clear_presentation(ep).await;
        assert!(store.get_presentation(ep).await.is_none());
    }

    #[tokio::test]
    async fn test_find_by_hash() {
        let store = PresentationStore::new(Identity::generate("local"));
        let peer = Identity::generate("peer");
        let ep = endpoint(12001);

        store.set_presentation(ep, peer.certificate().clone()).await;

        let found = store.find_by_hash(&peer.certificate().hash()).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, ep);

        let missing = store
            .find_by_hash(&Identity::generate("ghost").certificate().hash())
            .await;
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_local_identity_swap() {
        let first = Identity::generate("first");
        let first_hash = first.certificate().hash();
        let store = PresentationStore::new(first);

        assert_eq!(store.local_identity().await.certificate().hash(), first_hash);

        let second = Identity::generate("second");
        let second_hash = second.certificate().hash();
        store.set_local_identity(second).await;

        assert_eq!(
            store.local_identity().await.certificate().hash(),
            second_hash
        );
    }
}
