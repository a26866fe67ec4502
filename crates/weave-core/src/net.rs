//! IP networks and routes
//!
//! Prefix-aware address matching used by the router's longest-prefix lookup
//! and by the route acceptance policies.

use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// An IP network in CIDR form
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IpNetwork {
    address: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    /// Create a network, masking any host bits off the address
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, CoreError> {
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(CoreError::InvalidConfiguration(format!(
                "prefix length {} too long for {}",
                prefix_len, address
            )));
        }
        Ok(Self {
            address: mask_address(address, prefix_len),
            prefix_len,
        })
    }

    /// Create for a single host (/32 or /128)
    pub fn host(address: IpAddr) -> Self {
        let prefix_len = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            address,
            prefix_len,
        }
    }

    /// The (masked) network address
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// The prefix length
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether the network is IPv4
    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// Check whether an address falls inside this network
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.address, ip) {
            (IpAddr::V4(network), IpAddr::V4(target)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let mask = !0u32 << (32 - self.prefix_len);
                (u32::from(network) & mask) == (u32::from(target) & mask)
            }
            (IpAddr::V6(network), IpAddr::V6(target)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let mask = !0u128 << (128 - self.prefix_len);
                (u128::from(network) & mask) == (u128::from(target) & mask)
            }
            _ => false,
        }
    }

    /// Check whether another network is entirely inside this one
    pub fn contains_network(&self, other: &IpNetwork) -> bool {
        other.prefix_len >= self.prefix_len && self.contains(other.address)
    }

    /// Whether the network address is a plain unicast destination.
    ///
    /// The default route, multicast ranges and the IPv4 broadcast address
    /// do not qualify.
    pub fn is_unicast(&self) -> bool {
        match self.address {
            IpAddr::V4(addr) => {
                !addr.is_unspecified() && !addr.is_multicast() && !addr.is_broadcast()
            }
            IpAddr::V6(addr) => !addr.is_unspecified() && !addr.is_multicast(),
        }
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpNetwork {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix_len) = match s.split_once('/') {
            Some((address, prefix)) => {
                let address: IpAddr = address
                    .parse()
                    .map_err(|_| CoreError::InvalidConfiguration(format!("bad address: {}", s)))?;
                let prefix_len: u8 = prefix
                    .parse()
                    .map_err(|_| CoreError::InvalidConfiguration(format!("bad prefix: {}", s)))?;
                (address, prefix_len)
            }
            None => {
                let address: IpAddr = s
                    .parse()
                    .map_err(|_| CoreError::InvalidConfiguration(format!("bad address: {}", s)))?;
                return Ok(Self::host(address));
            }
        };
        Self::new(address, prefix_len)
    }
}

fn mask_address(address: IpAddr, prefix_len: u8) -> IpAddr {
    match address {
        IpAddr::V4(addr) => {
            if prefix_len == 0 {
                return IpAddr::V4(0u32.into());
            }
            let mask = !0u32 << (32 - prefix_len);
            IpAddr::V4((u32::from(addr) & mask).into())
        }
        IpAddr::V6(addr) => {
            if prefix_len == 0 {
                return IpAddr::V6(0u128.into());
            }
            let mask = !0u128 << (128 - prefix_len);
            IpAddr::V6((u128::from(addr) & mask).into())
        }
    }
}

/// An advertisable route: a network plus an optional gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IpRoute {
    pub network: IpNetwork,
    pub gateway: Option<IpAddr>,
}

impl IpRoute {
    /// A route without a gateway
    pub fn new(network: IpNetwork) -> Self {
        Self {
            network,
            gateway: None,
        }
    }

    /// A route through a gateway
    pub fn via(network: IpNetwork, gateway: IpAddr) -> Self {
        Self {
            network,
            gateway: Some(gateway),
        }
    }

    /// Whether the route carries a gateway
    pub fn has_gateway(&self) -> bool {
        self.gateway.is_some()
    }
}

impl std::fmt::Display for IpRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.gateway {
            Some(gateway) => write!(f, "{} via {}", self.network, gateway),
            None => write!(f, "{}", self.network),
        }
    }
}

impl FromStr for IpRoute {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(" via ") {
            Some((network, gateway)) => {
                let network = network.trim().parse()?;
                let gateway: IpAddr = gateway.trim().parse().map_err(|_| {
                    CoreError::InvalidConfiguration(format!("bad gateway: {}", s))
                })?;
                Ok(Self::via(network, gateway))
            }
            None => Ok(Self::new(s.trim().parse()?)),
        }
    }
}

/// Destination address of an IP packet, version detected from the header
pub fn ip_destination(packet: &[u8]) -> Option<IpAddr> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 => {
            if packet.len() < 20 {
                return None;
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&packet[16..20]);
            Some(IpAddr::from(octets))
        }
        6 => {
            if packet.len() < 40 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[24..40]);
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Build a minimal IPv4 packet toward a destination (tests and probes)
pub fn ipv4_packet_to(destination: std::net::Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total_len = 20 + payload.len();
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 0xFD;
    packet[16..20].copy_from_slice(&destination.octets());
    packet[20..].copy_from_slice(payload);
    packet
}
