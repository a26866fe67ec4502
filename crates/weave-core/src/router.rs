//! Layer-3 router
//!
//! Forwards IP packets between ports by longest-prefix match over each
//! port's advertised route set. The tap port owns the local routes (the
//! configured ones plus the interface's own subnets); peer ports get their
//! sets from the route-advertisement subprotocol.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{CoreError, CoreResult};
use crate::net::{ip_destination, IpRoute};
use crate::port::{Port, PortIndex};

struct RouterPort {
    port: Port,
    routes: BTreeSet<IpRoute>,
}

struct RouterState {
    ports: BTreeMap<PortIndex, RouterPort>,
}

/// The longest-prefix router
pub struct Router {
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouterState {
                ports: BTreeMap::new(),
            }),
        }
    }

    /// Attach a port with an empty route set
    pub async fn register_port(&self, index: PortIndex, port: Port) {
        debug!("router: registering port {}", index);
        self.state.lock().await.ports.insert(
            index,
            RouterPort {
                port,
                routes: BTreeSet::new(),
            },
        );
    }

    /// Detach a port and its routes
    pub async fn unregister_port(&self, index: PortIndex) {
        debug!("router: unregistering port {}", index);
        self.state.lock().await.ports.remove(&index);
    }

    /// Whether a port is registered
    pub async fn has_port(&self, index: PortIndex) -> bool {
        self.state.lock().await.ports.contains_key(&index)
    }

    /// Replace a port's advertised route set
    pub async fn set_local_routes(
        &self,
        index: PortIndex,
        routes: BTreeSet<IpRoute>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        match state.ports.get_mut(&index) {
            Some(port) => {
                debug!("router: port {} now advertises {} routes", index, routes.len());
                port.routes = routes;
                Ok(())
            }
            None => Err(CoreError::NoSuchPort(index.to_string())),
        }
    }

    /// A port's current route set
    pub async fn local_routes(&self, index: PortIndex) -> Option<BTreeSet<IpRoute>> {
        self.state
            .lock()
            .await
            .ports
            .get(&index)
            .map(|port| port.routes.clone())
    }

    /// Route a packet that arrived on `ingress`.
    ///
    /// The egress is the port (other than the ingress) whose advertised set
    /// contains the destination under the longest prefix; ties go to the
    /// lower port index. Packets with no matching route are dropped.
    pub async fn write(&self, ingress: PortIndex, packet: &[u8]) -> CoreResult<()> {
        let destination = match ip_destination(packet) {
            Some(destination) => destination,
            None => {
                return Err(CoreError::InvalidFrame("not an IP packet".into()));
            }
        };

        let state = self.state.lock().await;
        if !state.ports.contains_key(&ingress) {
            return Err(CoreError::NoSuchPort(ingress.to_string()));
        }

        // BTreeMap iteration is in ascending index order, so keeping the
        // first hit at each prefix length implements the tie-break.
        let mut best: Option<(u8, &RouterPort)> = None;
        for (index, port) in state.ports.iter() {
            if *index == ingress {
                continue;
            }
            for route in &port.routes {
                if route.network.contains(destination) {
                    let prefix_len = route.network.prefix_len();
                    let better = match best {
                        Some((best_len, _)) => prefix_len > best_len,
                        None => true,
                    };
                    if better {
                        best = Some((prefix_len, port));
                    }
                }
            }
        }

        match best {
            Some((_, egress)) => egress.port.write(packet).await,
            None => {
                trace!("router: no route to {}, dropping", destination);
                Ok(())
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
