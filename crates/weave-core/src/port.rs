//! Forwarding ports
//!
//! A port is a named forwarding endpoint inside the node: either the tap
//! adapter or a peer endpoint. It bundles an async write sink with a group
//! tag; the switch uses the group to decide flooding scope.

use std::cmp::Ordering;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CoreResult;

/// Group tag for the local tap adapter port
pub const TAP_ADAPTERS_GROUP: u32 = 0;

/// Group tag for peer endpoint ports
pub const ENDPOINTS_GROUP: u32 = 1;

/// Identifies a port: the tap adapter or a peer endpoint.
///
/// Ordered with `Tap` first so the router's tie-break prefers the local
/// adapter over any peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortIndex {
    Tap,
    Endpoint(SocketAddr),
}

impl PortIndex {
    fn sort_key(&self) -> (u8, u8, u128, u16) {
        match self {
            Self::Tap => (0, 0, 0, 0),
            Self::Endpoint(endpoint) => {
                let (family, ip) = match endpoint.ip() {
                    std::net::IpAddr::V4(addr) => (0u8, u128::from(u32::from(addr))),
                    std::net::IpAddr::V6(addr) => (1u8, u128::from(addr)),
                };
                (1, family, ip, endpoint.port())
            }
        }
    }
}

impl Ord for PortIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for PortIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for PortIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tap => write!(f, "tap"),
            Self::Endpoint(endpoint) => write!(f, "{}", endpoint),
        }
    }
}

/// The write side of a port
#[async_trait]
pub trait PortWriter: Send + Sync {
    async fn write(&self, frame: &[u8]) -> CoreResult<()>;
}

/// A registered port: a write sink plus its group tag
#[derive(Clone)]
pub struct Port {
    writer: Arc<dyn PortWriter>,
    group: u32,
}

impl Port {
    pub fn new(writer: Arc<dyn PortWriter>, group: u32) -> Self {
        Self { writer, group }
    }

    /// The port's group tag
    pub fn group(&self) -> u32 {
        self.group
    }

    /// Write a frame out of the port
    pub async fn write(&self, frame: &[u8]) -> CoreResult<()> {
        self.writer.write(frame).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A port writer that records every frame it is given
    pub struct MemoryPort {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl MemoryPort {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }

        pub fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }

        pub fn frame_count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PortWriter for MemoryPort {
        async fn write(&self, frame: &[u8]) -> CoreResult<()> {
            self.frames.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }
}
