//! Tap device boundary
//!
//! The OS virtual interface is a framed byte pipe to the core: frames in,
//! frames out, nothing else. Platform backends implement [`TapDevice`];
//! the in-memory pair stands in for the OS during tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::error::{CoreError, CoreResult};

/// Which layer the device carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapMode {
    /// Ethernet frames
    Tap,
    /// IP packets
    Tun,
}

/// Default payload MTU: 1500 minus the IP, UDP and FSCP overhead
pub const DEFAULT_MTU: u16 = 1446;

/// A tap or tun device as the core sees it
#[async_trait]
pub trait TapDevice: Send + Sync {
    /// Read one frame; blocks until a frame is available
    async fn read_frame(&self) -> CoreResult<Bytes>;

    /// Write one frame
    async fn write_frame(&self, frame: &[u8]) -> CoreResult<()>;

    /// The device name
    fn name(&self) -> &str;

    /// The device MTU
    fn mtu(&self) -> u16;

    /// Whether the device carries Ethernet frames or IP packets
    fn mode(&self) -> TapMode;

    /// Close the device; pending reads fail afterwards
    async fn close(&self) -> CoreResult<()>;
}

/// One end of an in-memory device pair
pub struct MemoryTap {
    name: String,
    mtu: u16,
    mode: TapMode,
    outbound: mpsc::Sender<Bytes>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
}

/// Create two cross-connected in-memory devices: frames written to one are
/// read from the other.
pub fn memory_tap_pair(mode: TapMode, mtu: u16) -> (Arc<MemoryTap>, Arc<MemoryTap>) {
    let (left_tx, left_rx) = mpsc::channel(256);
    let (right_tx, right_rx) = mpsc::channel(256);

    let left = Arc::new(MemoryTap {
        name: "memtap0".to_string(),
        mtu,
        mode,
        outbound: right_tx,
        inbound: Mutex::new(left_rx),
    });
    let right = Arc::new(MemoryTap {
        name: "memtap1".to_string(),
        mtu,
        mode,
        outbound: left_tx,
        inbound: Mutex::new(right_rx),
    });
    (left, right)
}

#[async_trait]
impl TapDevice for MemoryTap {
    async fn read_frame(&self) -> CoreResult<Bytes> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(CoreError::TapDeviceClosed)
    }

    async fn write_frame(&self, frame: &[u8]) -> CoreResult<()> {
        self.outbound
            .send(Bytes::copy_from_slice(frame))
            .await
            .map_err(|_| CoreError::TapDeviceClosed)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn mode(&self) -> TapMode {
        self.mode
    }

    async fn close(&self) -> CoreResult<()> {
        // Dropping the receiver makes the peer's writes fail; our reads end
        // once the peer drops its sender.
        self.inbound.lock().await.close();
        Ok(())
    }
}
