//! OS route manager boundary
//!
//! The core never talks to the operating system directly: it asks a
//! [`RouteManager`] for reference-counted handles. Cloning a handle shares
//! the underlying entry; when the last clone is dropped the route is
//! removed. The in-memory implementation records everything so tests can
//! assert on install/release ordering.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::error::CoreResult;
use crate::net::{IpNetwork, IpRoute};

/// A reference-counted hold on one installed route.
///
/// The route is removed when the last clone is dropped.
#[derive(Clone)]
pub struct RouteHandle {
    _registration: Arc<dyn Send + Sync>,
}

impl RouteHandle {
    /// Wrap a guard object whose `Drop` releases the route
    pub fn new(registration: Arc<dyn Send + Sync>) -> Self {
        Self {
            _registration: registration,
        }
    }
}

impl std::fmt::Debug for RouteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouteHandle")
    }
}

/// The add/query service the core depends on
#[async_trait]
pub trait RouteManager: Send + Sync {
    /// The system route currently used to reach an address
    async fn get_route_to(&self, address: IpAddr) -> CoreResult<RouteHandle>;

    /// Install a route, returning the handle that keeps it alive
    async fn add_route(&self, route: &IpRoute) -> CoreResult<RouteHandle>;
}

#[derive(Default)]
struct MemoryRouteTable {
    /// Installed routes with their reference counts
    installed: HashMap<IpRoute, usize>,
    /// Addresses pinned via `get_route_to`
    pinned: HashMap<IpAddr, usize>,
    /// Release order, for ordering assertions
    released: Vec<String>,
}

/// An in-memory route manager that records installs and releases
#[derive(Default)]
pub struct MemoryRouteManager {
    table: Arc<Mutex<MemoryRouteTable>>,
}

struct RouteRegistration {
    table: Arc<Mutex<MemoryRouteTable>>,
    route: IpRoute,
}

impl Drop for RouteRegistration {
    fn drop(&mut self) {
        let mut table = self.table.lock().expect("route table lock");
        if let Some(count) = table.installed.get_mut(&self.route) {
            *count -= 1;
            if *count == 0 {
                table.installed.remove(&self.route);
                let route = self.route.to_string();
                debug!("route {} removed", route);
                table.released.push(route);
            }
        }
    }
}

struct PinRegistration {
    table: Arc<Mutex<MemoryRouteTable>>,
    address: IpAddr,
}

impl Drop for PinRegistration {
    fn drop(&mut self) {
        let mut table = self.table.lock().expect("route table lock");
        if let Some(count) = table.pinned.get_mut(&self.address) {
            *count -= 1;
            if *count == 0 {
                table.pinned.remove(&self.address);
                table.released.push(format!("pin {}", self.address));
            }
        }
    }
}

impl MemoryRouteManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Routes currently installed
    pub fn installed_routes(&self) -> Vec<IpRoute> {
        let mut routes: Vec<IpRoute> = self
            .table
            .lock()
            .expect("route table lock")
            .installed
            .keys()
            .copied()
            .collect();
        routes.sort();
        routes
    }

    /// Addresses currently pinned by `get_route_to`
    pub fn pinned_addresses(&self) -> Vec<IpAddr> {
        let mut addresses: Vec<IpAddr> = self
            .table
            .lock()
            .expect("route table lock")
            .pinned
            .keys()
            .copied()
            .collect();
        addresses.sort();
        addresses
    }

    /// Every release event so far, in order
    pub fn release_log(&self) -> Vec<String> {
        self.table.lock().expect("route table lock").released.clone()
    }
}

#[async_trait]
impl RouteManager for MemoryRouteManager {
    async fn get_route_to(&self, address: IpAddr) -> CoreResult<RouteHandle> {
        let mut table = self.table.lock().expect("route table lock");
        *table.pinned.entry(address).or_insert(0) += 1;
        Ok(RouteHandle::new(Arc::new(PinRegistration {
            table: self.table.clone(),
            address,
        })))
    }

    async fn add_route(&self, route: &IpRoute) -> CoreResult<RouteHandle> {
        let mut table = self.table.lock().expect("route table lock");
        *table.installed.entry(*route).or_insert(0) += 1;
        debug!("route {} installed", route);
        Ok(RouteHandle::new(Arc::new(RouteRegistration {
            table: self.table.clone(),
            route: *route,
        })))
    }
}

/// Convenience: build the host route used to pin a peer's underlay address
pub fn host_route(address: IpAddr) -> IpRoute {
    IpRoute::new(IpNetwork::host(address))
}
