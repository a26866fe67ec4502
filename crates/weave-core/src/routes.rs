//! Route-advertisement subprotocol
//!
//! Two control messages travel on data channel 1: ROUTES_REQUEST (empty)
//! and ROUTES (a versioned route list). Inbound route sets pass two policy
//! filters: the internal policy decides what the router may use, the system
//! policy decides what may be installed into the OS routing table.

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::net::{IpNetwork, IpRoute};
use crate::route_manager::RouteHandle;

const TYPE_ROUTES_REQUEST: u8 = 0x01;
const TYPE_ROUTES: u8 = 0x02;

/// Which advertised routes the router may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalRoutePolicy {
    /// Accept nothing
    None,
    /// Unicast routes inside the tap's own subnets only
    UnicastInNetwork,
    /// Any unicast route
    Unicast,
    /// Any route inside the tap's own subnets
    Subnet,
    /// Everything
    Any,
}

/// Which advertised routes may enter the OS routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemRoutePolicy {
    /// Install nothing
    None,
    /// Unicast routes without a gateway
    Unicast,
    /// Unicast routes, gateways allowed
    UnicastWithGateway,
    /// Any route without a gateway
    Any,
    /// Everything
    AnyWithGateway,
}

impl std::fmt::Display for InternalRoutePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::UnicastInNetwork => "unicast_in_network",
            Self::Unicast => "unicast",
            Self::Subnet => "subnet",
            Self::Any => "any",
        };
        write!(f, "{}", name)
    }
}

impl std::fmt::Display for SystemRoutePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Unicast => "unicast",
            Self::UnicastWithGateway => "unicast_with_gateway",
            Self::Any => "any",
            Self::AnyWithGateway => "any_with_gateway",
        };
        write!(f, "{}", name)
    }
}

/// A message on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    RoutesRequest,
    Routes {
        version: u32,
        routes: BTreeSet<IpRoute>,
    },
}

impl ControlMessage {
    /// Serialize to channel-1 payload bytes
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::RoutesRequest => Bytes::from_static(&[TYPE_ROUTES_REQUEST]),
            Self::Routes { version, routes } => {
                let mut buf = BytesMut::new();
                buf.put_u8(TYPE_ROUTES);
                buf.put_u32(*version);
                buf.put_u16(routes.len() as u16);
                for route in routes {
                    match route.network.address() {
                        std::net::IpAddr::V4(addr) => {
                            buf.put_u8(4);
                            buf.put_slice(&addr.octets());
                        }
                        std::net::IpAddr::V6(addr) => {
                            buf.put_u8(6);
                            buf.put_slice(&addr.octets());
                        }
                    }
                    buf.put_u8(route.network.prefix_len());
                    match route.gateway {
                        Some(std::net::IpAddr::V4(gateway)) => {
                            buf.put_u8(4);
                            buf.put_slice(&gateway.octets());
                        }
                        Some(std::net::IpAddr::V6(gateway)) => {
                            buf.put_u8(6);
                            buf.put_slice(&gateway.octets());
                        }
                        None => buf.put_u8(0),
                    }
                }
                buf.freeze()
            }
        }
    }

    /// Parse from channel-1 payload bytes
    pub fn from_bytes(mut data: &[u8]) -> CoreResult<Self> {
        if data.is_empty() {
            return Err(CoreError::InvalidFrame("empty control message".into()));
        }
        let message_type = data.get_u8();
        match message_type {
            TYPE_ROUTES_REQUEST => {
                if !data.is_empty() {
                    return Err(CoreError::InvalidFrame("trailing bytes".into()));
                }
                Ok(Self::RoutesRequest)
            }
            TYPE_ROUTES => {
                if data.remaining() < 6 {
                    return Err(CoreError::InvalidFrame("routes header".into()));
                }
                let version = data.get_u32();
                let count = data.get_u16() as usize;
                let mut routes = BTreeSet::new();
                for _ in 0..count {
                    let network_address = take_address(&mut data)?;
                    if data.remaining() < 2 {
                        return Err(CoreError::InvalidFrame("route entry".into()));
                    }
                    let prefix_len = data.get_u8();
                    let network = IpNetwork::new(network_address, prefix_len)
                        .map_err(|_| CoreError::InvalidFrame("bad prefix length".into()))?;
                    let gateway_family = data.get_u8();
                    let gateway = match gateway_family {
                        0 => None,
                        4 | 6 => Some(take_address_of_family(&mut data, gateway_family)?),
                        _ => {
                            return Err(CoreError::InvalidFrame("bad gateway family".into()));
                        }
                    };
                    routes.insert(IpRoute { network, gateway });
                }
                if !data.is_empty() {
                    return Err(CoreError::InvalidFrame("trailing bytes".into()));
                }
                Ok(Self::Routes { version, routes })
            }
            other => Err(CoreError::InvalidFrame(format!(
                "unknown control message type 0x{:02x}",
                other
            ))),
        }
    }
}

fn take_address(data: &mut &[u8]) -> CoreResult<std::net::IpAddr> {
    if data.remaining() < 1 {
        return Err(CoreError::InvalidFrame("address family".into()));
    }
    let family = data.get_u8();
    take_address_of_family(data, family)
}

fn take_address_of_family(data: &mut &[u8], family: u8) -> CoreResult<std::net::IpAddr> {
    match family {
        4 => {
            if data.remaining() < 4 {
                return Err(CoreError::InvalidFrame("IPv4 address".into()));
            }
            let mut octets = [0u8; 4];
            data.copy_to_slice(&mut octets);
            Ok(std::net::IpAddr::from(octets))
        }
        6 => {
            if data.remaining() < 16 {
                return Err(CoreError::InvalidFrame("IPv6 address".into()));
            }
            let mut octets = [0u8; 16];
            data.copy_to_slice(&mut octets);
            Ok(std::net::IpAddr::from(octets))
        }
        _ => Err(CoreError::InvalidFrame(format!(
            "unknown address family {}",
            family
        ))),
    }
}

/// Per-family counting shared by both filters. A limit of zero means
/// unlimited.
struct FamilyBudget {
    ipv4_left: u32,
    ipv6_left: u32,
    unlimited: bool,
}

impl FamilyBudget {
    fn new(limit: u32) -> Self {
        Self {
            ipv4_left: limit,
            ipv6_left: limit,
            unlimited: limit == 0,
        }
    }

    fn admit(&mut self, route: &IpRoute) -> bool {
        if self.unlimited {
            return true;
        }
        let left = if route.network.is_ipv4() {
            &mut self.ipv4_left
        } else {
            &mut self.ipv6_left
        };
        if *left > 0 {
            *left -= 1;
            true
        } else {
            false
        }
    }
}

/// Filter an advertised set by the internal acceptance policy.
///
/// `tap_networks` are the tap interface's own subnets, used by the
/// `unicast_in_network` and `subnet` scopes.
pub fn filter_internal_routes(
    routes: &BTreeSet<IpRoute>,
    policy: InternalRoutePolicy,
    limit: u32,
    tap_networks: &[IpNetwork],
) -> BTreeSet<IpRoute> {
    let mut budget = FamilyBudget::new(limit);
    let mut result = BTreeSet::new();

    for route in routes {
        let admitted = match policy {
            InternalRoutePolicy::None => false,
            InternalRoutePolicy::UnicastInNetwork => {
                route.network.is_unicast()
                    && tap_networks
                        .iter()
                        .any(|network| network.contains_network(&route.network))
            }
            InternalRoutePolicy::Unicast => route.network.is_unicast(),
            InternalRoutePolicy::Subnet => tap_networks
                .iter()
                .any(|network| network.contains_network(&route.network)),
            InternalRoutePolicy::Any => true,
        };
        if admitted && budget.admit(route) {
            result.insert(*route);
        }
    }

    result
}

/// Filter an advertised set by the system acceptance policy
pub fn filter_system_routes(
    routes: &BTreeSet<IpRoute>,
    policy: SystemRoutePolicy,
    limit: u32,
) -> BTreeSet<IpRoute> {
    let mut budget = FamilyBudget::new(limit);
    let mut result = BTreeSet::new();

    for route in routes {
        let admitted = match policy {
            SystemRoutePolicy::None => false,
            SystemRoutePolicy::Unicast => route.network.is_unicast() && !route.has_gateway(),
            SystemRoutePolicy::UnicastWithGateway => route.network.is_unicast(),
            SystemRoutePolicy::Any => !route.has_gateway(),
            SystemRoutePolicy::AnyWithGateway => true,
        };
        if admitted && budget.admit(route) {
            result.insert(*route);
        }
    }

    result
}

/// Everything remembered about one peer's advertised routes
#[derive(Default)]
pub struct ClientRouterInfo {
    /// Highest accepted routes version
    pub version: Option<u32>,
    /// Handles for the OS routes installed on behalf of this peer
    pub system_route_entries: Vec<RouteHandle>,
    /// The pinned system route to the peer's underlay address; released last
    pub saved_system_route: Option<RouteHandle>,
}

impl ClientRouterInfo {
    /// Whether a received version advances past the stored one
    pub fn is_older_than(&self, version: u32) -> bool {
        match self.version {
            Some(current) => current < version,
            None => true,
        }
    }

    /// Release the per-peer route handles.
    ///
    /// Installed routes go first; the pinned route to the peer itself is
    /// released last so the underlay path never gets shadowed while overlay
    /// routes are still up.
    pub fn release(&mut self) {
        self.system_route_entries.clear();
        self.saved_system_route = None;
        self.version = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes(specs: &[&str]) -> BTreeSet<IpRoute> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn networks(specs: &[&str]) -> Vec<IpNetwork> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_control_message_roundtrip() {
        let request = ControlMessage::RoutesRequest;
        assert_eq!(
            ControlMessage::from_bytes(&request.to_bytes()).unwrap(),
            request
        );

        let message = ControlMessage::Routes {
            version: 5,
            routes: routes(&[
                "10.0.0.0/8",
                "192.168.0.0/16 via 192.168.0.1",
                "2001:db8::/32",
            ]),
        };
        assert_eq!(
            ControlMessage::from_bytes(&message.to_bytes()).unwrap(),
            message
        );
    }

    #[test]
    fn test_malformed_control_messages_rejected() {
        assert!(ControlMessage::from_bytes(&[]).is_err());
        assert!(ControlMessage::from_bytes(&[0x42]).is_err());
        assert!(ControlMessage::from_bytes(&[TYPE_ROUTES, 0, 0]).is_err());

        let message = ControlMessage::Routes {
            version: 1,
            routes: routes(&["10.0.0.0/8"]),
        };
        let bytes = message.to_bytes();
        assert!(ControlMessage::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_internal_policy_unicast_rejects_default_route() {
        // Scenario: peer advertises 10.0.0.0/8 and the default route with a
        // limit of one; only the unicast route survives.
        let advertised = routes(&["10.0.0.0/8", "0.0.0.0/0"]);
        let accepted = filter_internal_routes(
            &advertised,
            InternalRoutePolicy::Unicast,
            1,
            &[],
        );

        assert_eq!(accepted, routes(&["10.0.0.0/8"]));
    }

    #[test]
    fn test_internal_policy_unicast_in_network() {
        let advertised = routes(&["10.200.0.0/24", "10.201.0.0/24", "8.8.8.0/24"]);
        let tap = networks(&["10.200.0.0/16"]);

        let accepted = filter_internal_routes(
            &advertised,
            InternalRoutePolicy::UnicastInNetwork,
            0,
            &tap,
        );
        assert_eq!(accepted, routes(&["10.200.0.0/24"]));
    }

    #[test]
    fn test_internal_policy_subnet_keeps_non_unicast_in_network() {
        let advertised = routes(&["10.200.224.0/24", "10.201.0.0/24"]);
        let tap = networks(&["10.200.0.0/16"]);

        let accepted =
            filter_internal_routes(&advertised, InternalRoutePolicy::Subnet, 0, &tap);
        assert_eq!(accepted, routes(&["10.200.224.0/24"]));
    }

    #[test]
    fn test_internal_policy_none_rejects_everything() {
        let advertised = routes(&["10.0.0.0/8"]);
        assert!(
            filter_internal_routes(&advertised, InternalRoutePolicy::None, 0, &[]).is_empty()
        );
    }

    #[test]
    fn test_limit_is_per_family() {
        let advertised = routes(&["10.0.0.0/8", "172.16.0.0/12", "2001:db8::/32"]);

        let accepted =
            filter_internal_routes(&advertised, InternalRoutePolicy::Unicast, 1, &[]);
        // One IPv4 route and one IPv6 route survive.
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted.iter().filter(|r| r.network.is_ipv4()).count(), 1);
        assert_eq!(accepted.iter().filter(|r| !r.network.is_ipv4()).count(), 1);
    }

    #[test]
    fn test_system_policy_gateway_handling() {
        let advertised = routes(&["10.0.0.0/8", "172.16.0.0/12 via 172.16.0.1"]);

        let plain = filter_system_routes(&advertised, SystemRoutePolicy::Unicast, 0);
        assert_eq!(plain, routes(&["10.0.0.0/8"]));

        let with_gateway =
            filter_system_routes(&advertised, SystemRoutePolicy::UnicastWithGateway, 0);
        assert_eq!(with_gateway.len(), 2);
    }

    #[test]
    fn test_system_policy_any_variants() {
        let advertised = routes(&["0.0.0.0/0", "0.0.0.0/0 via 10.0.0.1"]);

        let without_gateway = filter_system_routes(&advertised, SystemRoutePolicy::Any, 0);
        assert_eq!(without_gateway, routes(&["0.0.0.0/0"]));

        let everything =
            filter_system_routes(&advertised, SystemRoutePolicy::AnyWithGateway, 0);
        assert_eq!(everything.len(), 2);

        assert!(filter_system_routes(&advertised, SystemRoutePolicy::None, 0).is_empty());
    }

    #[test]
    fn test_client_router_info_versioning() {
        let mut info = ClientRouterInfo::default();

        assert!(info.is_older_than(1));
        info.version = Some(5);
        assert!(!info.is_older_than(5));
        assert!(!info.is_older_than(4));
        assert!(info.is_older_than(6));

        info.release();
        assert!(info.is_older_than(1));
    }
}
