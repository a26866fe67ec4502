//! Core configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use weave_crypto::{CipherSuite, EllipticCurve};

use crate::error::{CoreError, CoreResult};
use crate::net::{IpNetwork, IpRoute};
use crate::routes::{InternalRoutePolicy, SystemRoutePolicy};
use crate::tap::{TapMode, DEFAULT_MTU};

/// Address family used when resolving contact hostnames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// How presented certificates are validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateValidationMethod {
    /// Delegate to the injected validator (CA store, CRLs)
    Default,
    /// Accept any well-formed certificate
    None,
}

/// How certificate revocation is checked by the external validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationValidationMethod {
    None,
    Last,
    All,
}

/// Tap adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapAdapterConfig {
    /// Whether a tap adapter is attached at all
    pub enabled: bool,
    /// Ethernet (tap) or IP (tun) mode
    pub mode: TapMode,
    /// Device name
    pub name: String,
    /// Payload MTU
    pub mtu: u16,
    /// IPv4 address and prefix on the interface
    pub ipv4_cidr: Option<IpNetwork>,
    /// IPv6 address and prefix on the interface
    pub ipv6_cidr: Option<IpNetwork>,
    /// Point-to-point remote address (tun mode)
    pub remote_ipv4: Option<Ipv4Addr>,
    /// Answer ARP queries on behalf of remote hosts
    pub arp_proxy_enabled: bool,
    /// MAC address the ARP proxy answers with, as a string
    pub arp_proxy_fake_mac: Option<String>,
    /// Serve DHCP on the interface
    pub dhcp_proxy_enabled: bool,
    /// Address range handed out by the DHCP proxy
    pub dhcp_server_ipv4_cidr: Option<IpNetwork>,
}

impl Default for TapAdapterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: TapMode::Tap,
            name: "weave0".to_string(),
            mtu: DEFAULT_MTU,
            ipv4_cidr: None,
            ipv6_cidr: None,
            remote_ipv4: None,
            arp_proxy_enabled: false,
            arp_proxy_fake_mac: None,
            dhcp_proxy_enabled: false,
            dhcp_server_ipv4_cidr: None,
        }
    }
}

/// Router and route-acceptance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Routes advertised for the local node
    pub local_ip_routes: Vec<IpRoute>,
    /// Whether ROUTES_REQUESTs are answered
    pub accept_routes_requests: bool,
    /// What the router may use from peer advertisements
    pub internal_route_acceptance_policy: InternalRoutePolicy,
    /// What may enter the OS routing table
    pub system_route_acceptance_policy: SystemRoutePolicy,
    /// Per-family cap on accepted routes per peer (0 = unlimited)
    pub maximum_routes_limit: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            local_ip_routes: Vec::new(),
            accept_routes_requests: true,
            internal_route_acceptance_policy: InternalRoutePolicy::UnicastInNetwork,
            system_route_acceptance_policy: SystemRoutePolicy::None,
            maximum_routes_limit: 1,
        }
    }
}

/// The full core configuration surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// UDP listen endpoint
    pub listen_on: SocketAddr,
    /// Address family for contact hostname resolution
    pub hostname_resolution_protocol: AddressFamily,
    /// Static peers contacted periodically, as host:port strings
    pub contact_list: Vec<String>,
    /// Peers known only by certificate hash (hex), found via CONTACT_REQUEST
    pub dynamic_contact_list: Vec<String>,
    /// Networks whose hosts are never contacted or answered
    pub never_contact_list: Vec<IpNetwork>,
    /// Whether CONTACT_REQUESTs are answered
    pub accept_contact_requests: bool,
    /// Whether CONTACT answers are acted upon
    pub accept_contacts: bool,
    /// Cipher suites in preference order
    pub cipher_suite_capabilities: Vec<CipherSuite>,
    /// Elliptic curves in preference order
    pub elliptic_curve_capabilities: Vec<EllipticCurve>,
    /// Certificate validation strategy
    pub certificate_validation_method: CertificateValidationMethod,
    /// Revocation checking strategy, forwarded to the external validator
    pub certificate_revocation_validation_method: RevocationValidationMethod,
    /// Tap adapter settings
    pub tap_adapter: TapAdapterConfig,
    /// Router settings
    pub router: RouterConfig,

    /// Interval of the static-contact timer
    pub contact_period: Duration,
    /// Interval of the dynamic-contact timer
    pub dynamic_contact_period: Duration,
    /// Interval of the routes-request broadcast timer
    pub routes_request_period: Duration,
    /// Interval between keep-alive ticks
    pub session_keep_alive_period: Duration,
    /// Inbound silence after which a session is dropped
    pub session_timeout: Duration,
    /// Age after which a session is rekeyed
    pub session_age: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            listen_on: SocketAddr::new(
                std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                weave_fscp::constants::DEFAULT_PORT,
            ),
            hostname_resolution_protocol: AddressFamily::Ipv4,
            contact_list: Vec::new(),
            dynamic_contact_list: Vec::new(),
            never_contact_list: Vec::new(),
            accept_contact_requests: true,
            accept_contacts: true,
            cipher_suite_capabilities: CipherSuite::default_capabilities(),
            elliptic_curve_capabilities: EllipticCurve::default_capabilities(),
            certificate_validation_method: CertificateValidationMethod::Default,
            certificate_revocation_validation_method: RevocationValidationMethod::None,
            tap_adapter: TapAdapterConfig::default(),
            router: RouterConfig::default(),
            contact_period: Duration::from_secs(30),
            dynamic_contact_period: Duration::from_secs(45),
            routes_request_period: Duration::from_secs(180),
            session_keep_alive_period: weave_fscp::constants::SESSION_KEEP_ALIVE_PERIOD,
            session_timeout: weave_fscp::constants::SESSION_TIMEOUT,
            session_age: weave_fscp::constants::SESSION_AGE,
        }
    }
}

impl CoreConfig {
    /// Check internal consistency
    pub fn validate(&self) -> CoreResult<()> {
        if self.tap_adapter.enabled
            && self.tap_adapter.mode == TapMode::Tun
            && self.tap_adapter.ipv4_cidr.is_none()
            && self.tap_adapter.ipv6_cidr.is_none()
        {
            return Err(CoreError::InvalidConfiguration(
                "tun mode requires an IPv4 or IPv6 address".into(),
            ));
        }
        if self.tap_adapter.mtu < 576 {
            return Err(CoreError::InvalidConfiguration(format!(
                "MTU {} is too small",
                self.tap_adapter.mtu
            )));
        }
        if self.cipher_suite_capabilities.is_empty() || self.elliptic_curve_capabilities.is_empty()
        {
            return Err(CoreError::InvalidConfiguration(
                "at least one cipher suite and one elliptic curve are required".into(),
            ));
        }
        for contact in &self.contact_list {
            if !contact.contains(':') {
                return Err(CoreError::InvalidConfiguration(format!(
                    "contact \"{}\" is not host:port",
                    contact
                )));
            }
        }
        for hash in &self.dynamic_contact_list {
            weave_crypto::CertificateHash::from_hex(hash).map_err(|_| {
                CoreError::InvalidConfiguration(format!(
                    "dynamic contact \"{}\" is not a certificate hash",
                    hash
                ))
            })?;
        }
        Ok(())
    }

    /// The tap interface's own subnets
    pub fn tap_networks(&self) -> Vec<IpNetwork> {
        self.tap_adapter
            .ipv4_cidr
            .into_iter()
            .chain(self.tap_adapter.ipv6_cidr)
            .collect()
    }

    /// Whether an address is on the never-contact list
    pub fn is_banned(&self, address: std::net::IpAddr) -> bool {
        self.never_contact_list
            .iter()
            .any(|network| network.contains(address))
    }
}
