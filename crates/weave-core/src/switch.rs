//! Layer-2 switch
//!
//! A MAC-learning forwarder between ports. Source addresses are learned on
//! every frame; unicast frames go to the learned port, everything else is
//! flooded. In the default hub-and-spoke mode a frame arriving from one
//! endpoint port is never flooded to another endpoint port, which keeps
//! peers from replicating each other's broadcast traffic.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{CoreError, CoreResult};
use crate::port::{Port, PortIndex};

/// Ethernet frame header size (destination, source, ethertype)
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// A 48-bit Ethernet address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress {
    octets: [u8; 6],
}

impl MacAddress {
    /// The broadcast address
    pub const BROADCAST: MacAddress = MacAddress {
        octets: [0xFF; 6],
    };

    /// Create from raw octets
    pub fn from_octets(octets: [u8; 6]) -> Self {
        Self { octets }
    }

    /// Get raw octets
    pub fn octets(&self) -> &[u8; 6] {
        &self.octets
    }

    /// Group bit: broadcast and multicast destinations
    pub fn is_multicast(&self) -> bool {
        self.octets[0] & 0x01 != 0
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.octets[0],
            self.octets[1],
            self.octets[2],
            self.octets[3],
            self.octets[4],
            self.octets[5]
        )
    }
}

/// Switch behavior knobs
#[derive(Clone, Debug)]
pub struct SwitchConfig {
    /// Flood across endpoint ports too (full mesh learning mode)
    pub relay_enabled: bool,
    /// Age after which a learned MAC entry is forgotten
    pub mac_entry_max_age: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            relay_enabled: false,
            mac_entry_max_age: Duration::from_secs(600),
        }
    }
}

struct LearnedEntry {
    port: PortIndex,
    learned_at: Instant,
}

struct SwitchState {
    ports: BTreeMap<PortIndex, Port>,
    table: HashMap<MacAddress, LearnedEntry>,
}

/// The MAC-learning switch
pub struct Switch {
    config: SwitchConfig,
    state: Mutex<SwitchState>,
}

impl Switch {
    pub fn new(config: SwitchConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SwitchState {
                ports: BTreeMap::new(),
                table: HashMap::new(),
            }),
        }
    }

    /// Attach a port
    pub async fn register_port(&self, index: PortIndex, port: Port) {
        debug!("switch: registering port {}", index);
        self.state.lock().await.ports.insert(index, port);
    }

    /// Detach a port and forget every MAC learned on it
    pub async fn unregister_port(&self, index: PortIndex) {
        debug!("switch: unregistering port {}", index);
        let mut state = self.state.lock().await;
        state.ports.remove(&index);
        state.table.retain(|_, entry| entry.port != index);
    }

    /// Whether a port is registered
    pub async fn has_port(&self, index: PortIndex) -> bool {
        self.state.lock().await.ports.contains_key(&index)
    }

    /// Number of learned MAC entries
    pub async fn learned_count(&self) -> usize {
        self.state.lock().await.table.len()
    }

    /// Forward a frame that arrived on `ingress`.
    ///
    /// The whole operation runs under the forwarding lock, so frames are
    /// switched one at a time and the table stays consistent.
    pub async fn write(&self, ingress: PortIndex, frame: &[u8]) -> CoreResult<()> {
        if frame.len() < ETHERNET_HEADER_SIZE {
            return Err(CoreError::InvalidFrame(format!(
                "ethernet frame too short: {} bytes",
                frame.len()
            )));
        }

        let mut destination = [0u8; 6];
        destination.copy_from_slice(&frame[0..6]);
        let destination = MacAddress::from_octets(destination);
        let mut source = [0u8; 6];
        source.copy_from_slice(&frame[6..12]);
        let source = MacAddress::from_octets(source);

        let mut state = self.state.lock().await;

        let ingress_group = match state.ports.get(&ingress) {
            Some(port) => port.group(),
            None => return Err(CoreError::NoSuchPort(ingress.to_string())),
        };

        // Learn (or refresh) the source address. Group addresses are never
        // valid sources.
        if !source.is_multicast() {
            state.table.insert(
                source,
                LearnedEntry {
                    port: ingress,
                    learned_at: Instant::now(),
                },
            );
        }

        let max_age = self.config.mac_entry_max_age;
        let learned_port = if destination.is_multicast() {
            None
        } else {
            match state.table.get(&destination) {
                Some(entry) if entry.learned_at.elapsed() <= max_age => Some(entry.port),
                Some(_) => {
                    state.table.remove(&destination);
                    None
                }
                None => None,
            }
        };

        match learned_port {
            Some(egress) => {
                if egress == ingress {
                    trace!("switch: {} hairpin to {}, dropping", destination, egress);
                    return Ok(());
                }
                match state.ports.get(&egress) {
                    Some(port) => port.write(frame).await,
                    None => {
                        state.table.remove(&destination);
                        Ok(())
                    }
                }
            }
            None => {
                // Unknown or group destination: flood. Without relaying,
                // frames never go endpoint-to-endpoint.
                for (index, port) in state.ports.iter() {
                    if *index == ingress {
                        continue;
                    }
                    if !self.config.relay_enabled
                        && port.group() == ingress_group
                        && ingress_group == crate::port::ENDPOINTS_GROUP
                    {
                        continue;
                    }
                    if let Err(error) = port.write(frame).await {
                        debug!("switch: flood to {} failed: {}", index, error);
                    }
                }
                Ok(())
            }
        }
    }

    /// Drop learned entries older than the configured age
    pub async fn expire(&self) {
        let max_age = self.config.mac_entry_max_age;
        self.state
            .lock()
            .await
            .table
            .retain(|_, entry| entry.learned_at.elapsed() <= max_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::test_support::MemoryPort;
    use crate::port::{ENDPOINTS_GROUP, TAP_ADAPTERS_GROUP};
    use std::sync::Arc;

    fn endpoint(n: u8) -> PortIndex {
        PortIndex::Endpoint(format!("10.0.0.{}:12000", n).parse().unwrap())
    }

    fn frame(destination: [u8; 6], source: [u8; 6]) -> Vec<u8> {
        let mut frame = vec![0u8; 64];
        frame[0..6].copy_from_slice(&destination);
        frame[6..12].copy_from_slice(&source);
        frame[12] = 0x08;
        frame
    }

    const BROADCAST: [u8; 6] = [0xFF; 6];
    const MAC_A: [u8; 6] = [0x02, 0, 0, 0, 0, 0xAA];
    const MAC_B: [u8; 6] = [0x02, 0, 0, 0, 0, 0xBB];

    async fn switch_with_ports(
        config: SwitchConfig,
    ) -> (Switch, Arc<MemoryPort>, Arc<MemoryPort>, Arc<MemoryPort>) {
        let switch = Switch::new(config);
        let tap = MemoryPort::new();
        let peer1 = MemoryPort::new();
        let peer2 = MemoryPort::new();

        switch
            .register_port(PortIndex::Tap, Port::new(tap.clone(), TAP_ADAPTERS_GROUP))
            .await;
        switch
            .register_port(endpoint(1), Port::new(peer1.clone(), ENDPOINTS_GROUP))
            .await;
        switch
            .register_port(endpoint(2), Port::new(peer2.clone(), ENDPOINTS_GROUP))
            .await;

        (switch, tap, peer1, peer2)
    }

    #[tokio::test]
    async fn test_broadcast_floods_other_groups_only() {
        let (switch, tap, peer1, peer2) = switch_with_ports(SwitchConfig::default()).await;

        // Broadcast from a peer: reaches the tap but not the other peer.
        switch
            .write(endpoint(1), &frame(BROADCAST, MAC_A))
            .await
            .unwrap();
        assert_eq!(tap.frame_count(), 1);
        assert_eq!(peer1.frame_count(), 0);
        assert_eq!(peer2.frame_count(), 0);

        // Broadcast from the tap reaches every peer.
        switch
            .write(PortIndex::Tap, &frame(BROADCAST, MAC_B))
            .await
            .unwrap();
        assert_eq!(peer1.frame_count(), 1);
        assert_eq!(peer2.frame_count(), 1);
        assert_eq!(tap.frame_count(), 1);
    }

    #[tokio::test]
    async fn test_relay_mode_floods_everywhere() {
        let config = SwitchConfig {
            relay_enabled: true,
            ..Default::default()
        };
        let (switch, tap, _peer1, peer2) = switch_with_ports(config).await;

        switch
            .write(endpoint(1), &frame(BROADCAST, MAC_A))
            .await
            .unwrap();
        assert_eq!(tap.frame_count(), 1);
        assert_eq!(peer2.frame_count(), 1);
    }

    #[tokio::test]
    async fn test_learned_unicast_goes_to_one_port() {
        let (switch, tap, peer1, peer2) = switch_with_ports(SwitchConfig::default()).await;

        // Learn MAC_A behind peer1.
        switch
            .write(endpoint(1), &frame(BROADCAST, MAC_A))
            .await
            .unwrap();
        assert_eq!(switch.learned_count().await, 1);

        // A unicast from the tap to MAC_A goes only to peer1.
        switch
            .write(PortIndex::Tap, &frame(MAC_A, MAC_B))
            .await
            .unwrap();
        assert_eq!(peer1.frame_count(), 1);
        assert_eq!(peer2.frame_count(), 0);
        assert_eq!(tap.frame_count(), 1);
    }

    #[tokio::test]
    async fn test_hairpin_dropped() {
        let (switch, tap, peer1, peer2) = switch_with_ports(SwitchConfig::default()).await;

        // MAC_A lives behind peer1; a frame from peer1 to MAC_A goes nowhere.
        switch
            .write(endpoint(1), &frame(BROADCAST, MAC_A))
            .await
            .unwrap();
        switch
            .write(endpoint(1), &frame(MAC_A, MAC_B))
            .await
            .unwrap();

        assert_eq!(tap.frame_count(), 1);
        assert_eq!(peer1.frame_count(), 0);
        assert_eq!(peer2.frame_count(), 0);
    }

    #[tokio::test]
    async fn test_entries_age_out() {
        let config = SwitchConfig {
            mac_entry_max_age: Duration::from_millis(0),
            ..Default::default()
        };
        let (switch, tap, _peer1, _peer2) = switch_with_ports(config).await;

        switch
            .write(endpoint(1), &frame(BROADCAST, MAC_A))
            .await
            .unwrap();
        assert_eq!(switch.learned_count().await, 1);

        // The entry is instantly stale; the unicast floods instead.
        switch
            .write(PortIndex::Tap, &frame(MAC_A, MAC_B))
            .await
            .unwrap();
        assert_eq!(tap.frame_count(), 1);

        switch.expire().await;
        // Only MAC_B (learned from the tap frame) may remain.
        assert!(switch.learned_count().await <= 1);
    }

    #[tokio::test]
    async fn test_unregister_forgets_learned_macs() {
        let (switch, _tap, _peer1, _peer2) = switch_with_ports(SwitchConfig::default()).await;

        switch
            .write(endpoint(1), &frame(BROADCAST, MAC_A))
            .await
            .unwrap();
        assert_eq!(switch.learned_count().await, 1);

        switch.unregister_port(endpoint(1)).await;
        assert_eq!(switch.learned_count().await, 0);
        assert!(!switch.has_port(endpoint(1)).await);
    }

    #[tokio::test]
    async fn test_short_frame_rejected() {
        let (switch, _tap, _peer1, _peer2) = switch_with_ports(SwitchConfig::default()).await;

        assert!(matches!(
            switch.write(PortIndex::Tap, &[0u8; 8]).await,
            Err(CoreError::InvalidFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_ingress_rejected() {
        let switch = Switch::new(SwitchConfig::default());

        assert!(matches!(
            switch
                .write(PortIndex::Tap, &frame(BROADCAST, MAC_A))
                .await,
            Err(CoreError::NoSuchPort(_))
        ));
    }
}
