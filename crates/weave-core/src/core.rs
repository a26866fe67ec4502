//! Core orchestrator
//!
//! Wires the tap device, the forwarding fabric and the FSCP server into a
//! running node: frames read from the tap enter the switch or router, frames
//! decrypted by the server enter from the peer's port, and three periodic
//! timers drive static contacting, dynamic contact discovery and route
//! advertisement.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use weave_crypto::{CertificateHash, CipherSuite, EllipticCurve, Identity, SignatureCertificate};
use weave_fscp::constants::{CHANNEL_FRAMES, CHANNEL_MESSAGES};
use weave_fscp::{
    normalize, FscpError, PresentationStatus, Server, ServerConfig, ServerHandler,
    SessionLossReason,
};

use crate::config::{CertificateValidationMethod, CoreConfig};
use crate::error::{CoreError, CoreResult};
use crate::net::IpRoute;
use crate::port::{Port, PortIndex, PortWriter, ENDPOINTS_GROUP, TAP_ADAPTERS_GROUP};
use crate::route_manager::RouteManager;
use crate::router::Router;
use crate::routes::{
    filter_internal_routes, filter_system_routes, ClientRouterInfo, ControlMessage,
    InternalRoutePolicy, SystemRoutePolicy,
};
use crate::switch::{Switch, SwitchConfig};
use crate::tap::{TapDevice, TapMode};
use crate::validator::CertificateValidator;

/// Callbacks surfaced by the core to the embedding application
#[async_trait]
pub trait CoreHandler: Send + Sync {
    async fn on_core_opened(&self) {}
    async fn on_core_closed(&self) {}

    async fn on_session_established(
        &self,
        _endpoint: SocketAddr,
        _is_new: bool,
        _cipher_suite: CipherSuite,
        _elliptic_curve: EllipticCurve,
    ) {
    }

    async fn on_session_failed(&self, _endpoint: SocketAddr, _is_new: bool) {}

    async fn on_session_error(&self, _endpoint: SocketAddr, _is_new: bool, _error: FscpError) {}

    async fn on_session_lost(&self, _endpoint: SocketAddr, _reason: SessionLossReason) {}

    /// Final say on certificate acceptance; `default_accept` is what the
    /// configured validation method decided
    async fn on_certificate_validation(
        &self,
        _certificate: &SignatureCertificate,
        default_accept: bool,
    ) -> bool {
        default_accept
    }

    async fn on_tap_adapter_up(&self, _name: &str) {}
    async fn on_tap_adapter_down(&self, _name: &str) {}
}

/// A no-op handler for embedders that only want the data plane
pub struct NullCoreHandler;

#[async_trait]
impl CoreHandler for NullCoreHandler {}

enum Fabric {
    Switch(Switch),
    Router(Router),
}

impl Fabric {
    async fn write(&self, ingress: PortIndex, frame: &[u8]) -> CoreResult<()> {
        match self {
            Self::Switch(switch) => switch.write(ingress, frame).await,
            Self::Router(router) => router.write(ingress, frame).await,
        }
    }

    async fn register_port(&self, index: PortIndex, port: Port) {
        match self {
            Self::Switch(switch) => switch.register_port(index, port).await,
            Self::Router(router) => router.register_port(index, port).await,
        }
    }

    async fn unregister_port(&self, index: PortIndex) {
        match self {
            Self::Switch(switch) => switch.unregister_port(index).await,
            Self::Router(router) => router.unregister_port(index).await,
        }
    }
}

struct CoreInner {
    config: CoreConfig,
    handler: Arc<dyn CoreHandler>,
    validator: Arc<dyn CertificateValidator>,
    route_manager: Arc<dyn RouteManager>,
    tap: Arc<dyn TapDevice>,
    fabric: Fabric,
    server: OnceLock<Arc<Server>>,
    client_info: Mutex<HashMap<SocketAddr, ClientRouterInfo>>,
    local_routes_version: u32,
    dynamic_contact_hashes: Vec<CertificateHash>,
    closed: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl CoreInner {
    fn server(&self) -> Option<Arc<Server>> {
        self.server.get().cloned()
    }
}

/// The assembled VPN node core
pub struct Core {
    inner: Arc<CoreInner>,
}

struct TapPortWriter {
    queue: mpsc::Sender<Bytes>,
}

#[async_trait]
impl PortWriter for TapPortWriter {
    async fn write(&self, frame: &[u8]) -> CoreResult<()> {
        self.queue
            .send(Bytes::copy_from_slice(frame))
            .await
            .map_err(|_| CoreError::TapDeviceClosed)
    }
}

struct PeerPortWriter {
    server: Arc<Server>,
    endpoint: SocketAddr,
}

#[async_trait]
impl PortWriter for PeerPortWriter {
    async fn write(&self, frame: &[u8]) -> CoreResult<()> {
        self.server
            .send_data(self.endpoint, CHANNEL_FRAMES, frame)
            .await?;
        Ok(())
    }
}

struct CoreServerHandler {
    core: Weak<CoreInner>,
}

impl Core {
    /// Build and start the node.
    ///
    /// The tap device, OS route manager and certificate validator are the
    /// external collaborators; the caller owns their construction.
    pub async fn open(
        config: CoreConfig,
        identity: Identity,
        tap: Arc<dyn TapDevice>,
        route_manager: Arc<dyn RouteManager>,
        validator: Arc<dyn CertificateValidator>,
        handler: Arc<dyn CoreHandler>,
    ) -> CoreResult<Core> {
        config.validate()?;
        if tap.mode() != config.tap_adapter.mode {
            return Err(CoreError::InvalidConfiguration(
                "tap device mode does not match the configuration".into(),
            ));
        }

        let fabric = match config.tap_adapter.mode {
            TapMode::Tap => Fabric::Switch(Switch::new(SwitchConfig::default())),
            TapMode::Tun => Fabric::Router(Router::new()),
        };

        let dynamic_contact_hashes = config
            .dynamic_contact_list
            .iter()
            .map(|hex| CertificateHash::from_hex(hex))
            .collect::<Result<Vec<_>, _>>()?;

        let (tap_write_tx, tap_write_rx) = mpsc::channel::<Bytes>(256);

        let inner = Arc::new(CoreInner {
            config,
            handler,
            validator,
            route_manager,
            tap,
            fabric,
            server: OnceLock::new(),
            client_info: Mutex::new(HashMap::new()),
            local_routes_version: 1,
            dynamic_contact_hashes,
            closed: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let server_handler = Arc::new(CoreServerHandler {
            core: Arc::downgrade(&inner),
        });
        let server_config = ServerConfig {
            cipher_suites: inner.config.cipher_suite_capabilities.clone(),
            elliptic_curves: inner.config.elliptic_curve_capabilities.clone(),
            keep_alive_period: inner.config.session_keep_alive_period,
            session_timeout: inner.config.session_timeout,
            session_age: inner.config.session_age,
            ..Default::default()
        };
        let server = Server::open(
            inner.config.listen_on,
            server_config,
            identity,
            server_handler,
        )
        .await?;
        let _ = inner.server.set(server);

        // The tap port: frames leaving the fabric toward the OS go through
        // a dedicated write queue, one frame at a time.
        inner
            .fabric
            .register_port(
                PortIndex::Tap,
                Port::new(
                    Arc::new(TapPortWriter {
                        queue: tap_write_tx,
                    }),
                    TAP_ADAPTERS_GROUP,
                ),
            )
            .await;

        if let Fabric::Router(router) = &inner.fabric {
            let mut local_routes: BTreeSet<IpRoute> = inner
                .config
                .router
                .local_ip_routes
                .iter()
                .copied()
                .collect();
            for network in inner.config.tap_networks() {
                local_routes.insert(IpRoute::new(network));
            }
            router
                .set_local_routes(PortIndex::Tap, local_routes)
                .await?;
        }

        let core = Core { inner };
        core.spawn_tap_writer(tap_write_rx);
        core.spawn_tap_reader();
        core.spawn_contact_timer();
        core.spawn_dynamic_contact_timer();
        core.spawn_routes_request_timer();

        info!(
            "core opened on {} (tap adapter \"{}\", {} mode)",
            core.inner.config.listen_on,
            core.inner.tap.name(),
            match core.inner.config.tap_adapter.mode {
                TapMode::Tap => "ethernet",
                TapMode::Tun => "ip",
            }
        );
        core.inner
            .handler
            .on_tap_adapter_up(core.inner.tap.name())
            .await;
        core.inner.handler.on_core_opened().await;

        Ok(core)
    }

    /// The underlying protocol server
    pub fn server(&self) -> Arc<Server> {
        self.inner
            .server()
            .expect("server is set before open() returns")
    }

    /// Resolve, greet and introduce ourselves to an endpoint
    pub async fn contact(&self, endpoint: SocketAddr) -> CoreResult<()> {
        let endpoint = normalize(endpoint);
        if self.inner.config.is_banned(endpoint.ip()) {
            debug!("not contacting banned endpoint {}", endpoint);
            return Ok(());
        }
        let server = self.server();
        server
            .greet(endpoint, weave_fscp::constants::HELLO_TIMEOUT)
            .await?;
        server.introduce_to(endpoint).await?;
        Ok(())
    }

    /// The routes currently advertised by a peer's router port
    pub async fn advertised_routes_of(&self, endpoint: SocketAddr) -> Option<BTreeSet<IpRoute>> {
        match &self.inner.fabric {
            Fabric::Router(router) => {
                router
                    .local_routes(PortIndex::Endpoint(normalize(endpoint)))
                    .await
            }
            Fabric::Switch(_) => None,
        }
    }

    /// Stop the node: timers, server and tap device
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("core closing");

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().expect("task list lock"));
        for task in tasks {
            task.abort();
        }

        if let Some(server) = self.inner.server() {
            server.close().await;
        }
        if let Err(error) = self.inner.tap.close().await {
            warn!("error closing tap device: {}", error);
        }

        // Release every per-peer route handle; pinned routes go last.
        let mut client_info = self.inner.client_info.lock().await;
        for (_, mut info) in client_info.drain() {
            info.release();
        }
        drop(client_info);

        self.inner
            .handler
            .on_tap_adapter_down(self.inner.tap.name())
            .await;
        self.inner.handler.on_core_closed().await;
    }

    fn track(&self, task: JoinHandle<()>) {
        self.inner.tasks.lock().expect("task list lock").push(task);
    }

    fn spawn_tap_writer(&self, mut queue: mpsc::Receiver<Bytes>) {
        let inner = self.inner.clone();
        self.track(tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(error) = inner.tap.write_frame(&frame).await {
                    debug!("tap write failed: {}", error);
                    break;
                }
            }
        }));
    }

    fn spawn_tap_reader(&self) {
        let inner = self.inner.clone();
        self.track(tokio::spawn(async move {
            loop {
                match inner.tap.read_frame().await {
                    Ok(frame) => {
                        if let Err(error) = inner.fabric.write(PortIndex::Tap, &frame).await {
                            trace!("tap frame not forwarded: {}", error);
                        }
                    }
                    Err(_) => {
                        debug!("tap device closed, reader stopping");
                        break;
                    }
                }
            }
        }));
    }

    fn spawn_contact_timer(&self) {
        let inner = self.inner.clone();
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.contact_period);
            loop {
                ticker.tick().await;
                contact_tick(&inner).await;
            }
        }));
    }

    fn spawn_dynamic_contact_timer(&self) {
        let inner = self.inner.clone();
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.dynamic_contact_period);
            loop {
                ticker.tick().await;
                if inner.dynamic_contact_hashes.is_empty() {
                    continue;
                }
                if let Some(server) = inner.server() {
                    let _ = server
                        .send_contact_request_to_all(&inner.dynamic_contact_hashes)
                        .await;
                }
            }
        }));
    }

    fn spawn_routes_request_timer(&self) {
        let inner = self.inner.clone();
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.routes_request_period);
            loop {
                ticker.tick().await;
                if let Some(server) = inner.server() {
                    let request = ControlMessage::RoutesRequest.to_bytes();
                    let _ = server.send_data_to_all(CHANNEL_MESSAGES, &request).await;
                }
            }
        }));
    }
}

async fn contact_tick(inner: &Arc<CoreInner>) {
    let server = match inner.server() {
        Some(server) => server,
        None => return,
    };

    for contact in &inner.config.contact_list {
        let endpoint = match resolve_contact(inner, contact).await {
            Some(endpoint) => endpoint,
            None => continue,
        };
        if inner.config.is_banned(endpoint.ip()) {
            continue;
        }
        if server.has_session_with(endpoint).await {
            continue;
        }

        debug!("contacting {} ({})", contact, endpoint);
        let server = server.clone();
        tokio::spawn(async move {
            match server
                .greet(endpoint, weave_fscp::constants::HELLO_TIMEOUT)
                .await
            {
                Ok(rtt) => {
                    trace!("{} answered in {:?}", endpoint, rtt);
                    let _ = server.introduce_to(endpoint).await;
                }
                Err(error) => debug!("greeting {} failed: {}", endpoint, error),
            }
        });
    }
}

async fn resolve_contact(inner: &Arc<CoreInner>, contact: &str) -> Option<SocketAddr> {
    use crate::config::AddressFamily;

    match tokio::net::lookup_host(contact).await {
        Ok(addresses) => {
            let wanted = inner.config.hostname_resolution_protocol;
            addresses
                .map(normalize)
                .find(|address| match wanted {
                    AddressFamily::Ipv4 => address.is_ipv4(),
                    AddressFamily::Ipv6 => address.is_ipv6(),
                })
        }
        Err(error) => {
            debug!("unable to resolve {}: {}", contact, error);
            None
        }
    }
}

impl CoreServerHandler {
    fn inner(&self) -> Option<Arc<CoreInner>> {
        self.core.upgrade()
    }
}

#[async_trait]
impl ServerHandler for CoreServerHandler {
    async fn on_hello_received(&self, sender: SocketAddr, default_accept: bool) -> bool {
        let inner = match self.inner() {
            Some(inner) => inner,
            None => return false,
        };

        if inner.config.is_banned(sender.ip()) {
            warn!("ignoring HELLO from banned host {}", sender);
            return false;
        }
        if default_accept {
            // Make ourselves known so the peer can initiate a session.
            if let Some(server) = inner.server() {
                let _ = server.introduce_to(sender).await;
            }
        }
        default_accept
    }

    async fn on_presentation_received(
        &self,
        sender: SocketAddr,
        certificate: &SignatureCertificate,
        _status: PresentationStatus,
        has_session: bool,
    ) -> bool {
        let inner = match self.inner() {
            Some(inner) => inner,
            None => return false,
        };

        if inner.config.is_banned(sender.ip()) {
            warn!("ignoring PRESENTATION from banned host {}", sender);
            return false;
        }
        if has_session {
            debug!(
                "ignoring PRESENTATION from {}: a session is already active",
                sender
            );
            return false;
        }

        let default_accept = match inner.config.certificate_validation_method {
            CertificateValidationMethod::None => true,
            CertificateValidationMethod::Default => {
                inner.validator.validate(certificate).await
            }
        };
        let accept = inner
            .handler
            .on_certificate_validation(certificate, default_accept)
            .await;

        if !accept {
            warn!(
                "rejecting PRESENTATION from {} ({})",
                sender,
                certificate.subject()
            );
            return false;
        }

        info!(
            "accepted PRESENTATION from {} ({})",
            sender,
            certificate.subject()
        );
        if let Some(server) = inner.server() {
            if let Err(error) = server.request_session(sender).await {
                debug!("session request to {} not sent: {}", sender, error);
            }
        }
        true
    }

    async fn on_session_established(
        &self,
        endpoint: SocketAddr,
        is_new: bool,
        cipher_suite: CipherSuite,
        elliptic_curve: EllipticCurve,
    ) {
        let inner = match self.inner() {
            Some(inner) => inner,
            None => return,
        };

        if is_new {
            if let Some(server) = inner.server() {
                inner
                    .fabric
                    .register_port(
                        PortIndex::Endpoint(endpoint),
                        Port::new(
                            Arc::new(PeerPortWriter {
                                server: server.clone(),
                                endpoint,
                            }),
                            ENDPOINTS_GROUP,
                        ),
                    )
                    .await;

                // Pin the underlay route to the peer before any overlay
                // route can shadow it.
                match inner.route_manager.get_route_to(endpoint.ip()).await {
                    Ok(handle) => {
                        let mut client_info = inner.client_info.lock().await;
                        client_info.entry(endpoint).or_default().saved_system_route =
                            Some(handle);
                    }
                    Err(error) => {
                        warn!("unable to pin system route to {}: {}", endpoint, error)
                    }
                }

                if matches!(inner.fabric, Fabric::Router(_)) {
                    let request = ControlMessage::RoutesRequest.to_bytes();
                    let _ = server.send_data(endpoint, CHANNEL_MESSAGES, &request).await;
                }
            }
        }

        inner
            .handler
            .on_session_established(endpoint, is_new, cipher_suite, elliptic_curve)
            .await;
    }

    async fn on_session_failed(&self, endpoint: SocketAddr, is_new: bool) {
        if let Some(inner) = self.inner() {
            inner.handler.on_session_failed(endpoint, is_new).await;
        }
    }

    async fn on_session_error(&self, endpoint: SocketAddr, is_new: bool, error: FscpError) {
        if let Some(inner) = self.inner() {
            inner.handler.on_session_error(endpoint, is_new, error).await;
        }
    }

    async fn on_session_lost(&self, endpoint: SocketAddr, reason: SessionLossReason) {
        let inner = match self.inner() {
            Some(inner) => inner,
            None => return,
        };

        inner.fabric.unregister_port(PortIndex::Endpoint(endpoint)).await;

        // Installed routes are released before the pinned underlay route.
        let removed = inner.client_info.lock().await.remove(&endpoint);
        if let Some(mut info) = removed {
            info.release();
        }

        inner.handler.on_session_lost(endpoint, reason).await;
    }

    async fn on_data_received(&self, sender: SocketAddr, channel: u8, data: Bytes) {
        let inner = match self.inner() {
            Some(inner) => inner,
            None => return,
        };

        match channel {
            CHANNEL_FRAMES => {
                if let Err(error) = inner
                    .fabric
                    .write(PortIndex::Endpoint(sender), &data)
                    .await
                {
                    trace!("frame from {} not forwarded: {}", sender, error);
                }
            }
            CHANNEL_MESSAGES => match ControlMessage::from_bytes(&data) {
                Ok(ControlMessage::RoutesRequest) => {
                    handle_routes_request(&inner, sender).await
                }
                Ok(ControlMessage::Routes { version, routes }) => {
                    handle_routes(&inner, sender, version, routes).await
                }
                Err(error) => {
                    warn!("badly formed control message from {}: {}", sender, error)
                }
            },
            other => {
                warn!(
                    "received {} byte(s) on unhandled channel {} from {}",
                    data.len(),
                    other,
                    sender
                );
            }
        }
    }

    async fn on_contact_request_received(
        &self,
        sender: SocketAddr,
        certificate: &SignatureCertificate,
        hash: CertificateHash,
        answer: SocketAddr,
    ) -> bool {
        let inner = match self.inner() {
            Some(inner) => inner,
            None => return false,
        };

        if inner.config.accept_contact_requests {
            info!(
                "sharing contact {} ({}) at {} with {}",
                hash,
                certificate.subject(),
                answer,
                sender
            );
            true
        } else {
            false
        }
    }

    async fn on_contact_received(
        &self,
        sender: SocketAddr,
        hash: CertificateHash,
        answer: SocketAddr,
    ) {
        let inner = match self.inner() {
            Some(inner) => inner,
            None => return,
        };

        if !inner.config.accept_contacts {
            return;
        }
        if inner.config.is_banned(answer.ip()) {
            warn!(
                "contact from {}: {} is at {} but will not be contacted",
                sender, hash, answer
            );
            return;
        }

        info!("contact from {}: {} is at {}", sender, hash, answer);
        if let Some(server) = inner.server() {
            tokio::spawn(async move {
                if server
                    .greet(answer, weave_fscp::constants::HELLO_TIMEOUT)
                    .await
                    .is_ok()
                {
                    let _ = server.introduce_to(answer).await;
                }
            });
        }
    }

    async fn on_server_closed(&self) {
        if let Some(inner) = self.inner() {
            if !inner.closed.swap(true, Ordering::SeqCst) {
                inner.handler.on_core_closed().await;
            }
        }
    }
}

async fn handle_routes_request(inner: &Arc<CoreInner>, sender: SocketAddr) {
    if !inner.config.router.accept_routes_requests {
        debug!(
            "ignoring routes request from {} as the configuration requires",
            sender
        );
        return;
    }

    let (version, routes) = match &inner.fabric {
        Fabric::Router(router) => {
            let routes = router
                .local_routes(PortIndex::Tap)
                .await
                .unwrap_or_default();
            (inner.local_routes_version, routes)
        }
        Fabric::Switch(_) => {
            // Ethernet mode has no router port; advertise the configured
            // local routes as-is.
            let routes = inner
                .config
                .router
                .local_ip_routes
                .iter()
                .copied()
                .collect();
            (0, routes)
        }
    };

    debug!(
        "answering routes request from {} with version {} ({} routes)",
        sender,
        version,
        routes.len()
    );
    if let Some(server) = inner.server() {
        let reply = ControlMessage::Routes { version, routes }.to_bytes();
        let _ = server.send_data(sender, CHANNEL_MESSAGES, &reply).await;
    }
}

async fn handle_routes(
    inner: &Arc<CoreInner>,
    sender: SocketAddr,
    version: u32,
    routes: BTreeSet<IpRoute>,
) {
    let mut client_info = inner.client_info.lock().await;
    let info = client_info.entry(sender).or_default();

    if !info.is_older_than(version) {
        debug!(
            "ignoring routes from {} with version {}: not newer",
            sender, version
        );
        return;
    }

    let tap_networks = inner.config.tap_networks();
    let router_config = &inner.config.router;

    // Stage one: what may the router use.
    let filtered = match &inner.fabric {
        Fabric::Router(router) => {
            if router_config.internal_route_acceptance_policy == InternalRoutePolicy::None {
                warn!(
                    "received routes from {} (version {}) will be ignored, as the configuration requires",
                    sender, version
                );
                return;
            }

            let filtered = filter_internal_routes(
                &routes,
                router_config.internal_route_acceptance_policy,
                router_config.maximum_routes_limit,
                &tap_networks,
            );
            if filtered != routes {
                if filtered.is_empty() && !routes.is_empty() {
                    warn!(
                        "no route from {} (version {}) matched the internal acceptance policy ({}, limit {})",
                        sender,
                        version,
                        router_config.internal_route_acceptance_policy,
                        router_config.maximum_routes_limit
                    );
                    return;
                }
                let excluded: Vec<String> = routes
                    .difference(&filtered)
                    .map(|route| route.to_string())
                    .collect();
                warn!(
                    "some routes from {} did not match the internal acceptance policy ({}): {}",
                    sender,
                    router_config.internal_route_acceptance_policy,
                    excluded.join(", ")
                );
            }

            match router
                .set_local_routes(PortIndex::Endpoint(sender), filtered.clone())
                .await
            {
                Ok(()) => info!(
                    "routes from {} (version {}) applied: {} route(s)",
                    sender,
                    version,
                    filtered.len()
                ),
                Err(error) => {
                    debug!(
                        "unable to apply routes from {}: {}. Doing nothing",
                        sender, error
                    );
                    return;
                }
            }
            filtered
        }
        Fabric::Switch(_) => {
            if router_config.system_route_acceptance_policy == SystemRoutePolicy::None {
                warn!(
                    "received routes from {} (version {}) will be ignored, as the configuration requires",
                    sender, version
                );
                return;
            }
            routes.clone()
        }
    };

    // Stage two: what may enter the OS routing table. Routes already covered
    // by the tap interface's own subnets are silently skipped.
    let outside_tap: BTreeSet<IpRoute> = filtered
        .iter()
        .filter(|route| {
            !tap_networks
                .iter()
                .any(|network| network.contains_network(&route.network))
        })
        .copied()
        .collect();

    let system_routes = filter_system_routes(
        &outside_tap,
        router_config.system_route_acceptance_policy,
        router_config.maximum_routes_limit,
    );
    if system_routes != outside_tap && !outside_tap.is_empty() && !system_routes.is_empty() {
        let excluded: Vec<String> = outside_tap
            .difference(&system_routes)
            .map(|route| route.to_string())
            .collect();
        warn!(
            "some system routes from {} did not match the system acceptance policy ({}): {}",
            sender,
            router_config.system_route_acceptance_policy,
            excluded.join(", ")
        );
    }

    let mut new_entries = Vec::new();
    for route in &system_routes {
        match inner.route_manager.add_route(route).await {
            Ok(handle) => new_entries.push(handle),
            Err(error) => warn!("installing route {} failed: {}", route, error),
        }
    }

    // Replacing the vector drops the previous handles, atomically removing
    // routes the peer no longer advertises. The pinned underlay route is
    // untouched.
    info.system_route_entries = new_entries;
    info.version = Some(version);
}
