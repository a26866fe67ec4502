//! VPN node core
//!
//! Ties the FSCP peer protocol to a forwarding fabric:
//! - a MAC-learning layer-2 switch (tap mode) or a longest-prefix layer-3
//!   router (tun mode) with named ports
//! - the route-advertisement subprotocol with acceptance policies and OS
//!   route installation
//! - the orchestrator that owns the tap device, the contact timers and the
//!   session lifecycle wiring
//!
//! The tap device, the OS route manager and the certificate validator are
//! injected boundaries; in-memory implementations back the tests.

pub mod config;
pub mod core;
pub mod error;
pub mod net;
pub mod port;
pub mod route_manager;
pub mod router;
pub mod routes;
pub mod switch;
pub mod tap;
pub mod validator;

pub use crate::core::{Core, CoreHandler, NullCoreHandler};
pub use config::{
    AddressFamily, CertificateValidationMethod, CoreConfig, RouterConfig, TapAdapterConfig,
};
pub use error::{CoreError, CoreResult};
pub use net::{ip_destination, IpNetwork, IpRoute};
pub use port::{Port, PortIndex, PortWriter, ENDPOINTS_GROUP, TAP_ADAPTERS_GROUP};
pub use route_manager::{MemoryRouteManager, RouteHandle, RouteManager};
pub use router::Router;
pub use routes::{
    filter_internal_routes, filter_system_routes, ClientRouterInfo, ControlMessage,
    InternalRoutePolicy, SystemRoutePolicy,
};
pub use switch::{MacAddress, Switch, SwitchConfig};
pub use tap::{memory_tap_pair, MemoryTap, TapDevice, TapMode, DEFAULT_MTU};
pub use validator::{AcceptAllValidator, CertificateValidator, RejectAllValidator};
