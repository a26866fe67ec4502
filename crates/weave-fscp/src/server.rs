//! FSCP protocol server
//!
//! Owns the UDP socket. Inbound datagrams are decoded and dispatched to the
//! presentation, session or greeter state; outbound sends are funneled
//! through a single writer task so datagrams never interleave and leave in
//! order. Handshake and data-plane rules live here and in [`crate::session`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use weave_crypto::{
    first_common_cipher_suite, first_common_elliptic_curve, CertificateHash, CipherSuite,
    EllipticCurve, Identity, SignatureCertificate,
};

use crate::constants::{
    CHANNEL_COUNT, HELLO_TIMEOUT, KEEP_ALIVE_DATA_SIZE, MAX_DATAGRAM_SIZE, SEQUENCE_THRESHOLD,
    SESSION_AGE, SESSION_KEEP_ALIVE_PERIOD, SESSION_REQUEST_MIN_INTERVAL, SESSION_TIMEOUT,
};
use crate::error::{FscpError, FscpResult};
use crate::greeter::Greeter;
use crate::message::{
    parse_contact_map, parse_hash_list, write_contact_map, write_hash_list, DataKind, DataMessage,
    Message, SessionMessage, SessionRequestMessage,
};
use crate::presentation::{PresentationStatus, PresentationStore};
use crate::session::{OpenOutcome, PeerSession, SessionLossReason};

/// Tunable protocol parameters
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Cipher suites in local preference order
    pub cipher_suites: Vec<CipherSuite>,
    /// Elliptic curves in local preference order
    pub elliptic_curves: Vec<EllipticCurve>,
    /// Whether HELLO_REQUESTs are answered by default
    pub accept_hello_messages: bool,
    /// Whether SESSION_REQUESTs are answered by default
    pub accept_session_requests: bool,
    /// Whether SESSION messages are accepted by default
    pub accept_sessions: bool,
    /// Interval between keep-alive ticks
    pub keep_alive_period: Duration,
    /// Inbound silence after which a session is dropped
    pub session_timeout: Duration,
    /// Age after which a session is rekeyed
    pub session_age: Duration,
    /// Sequence number past which a session is rekeyed
    pub sequence_threshold: u32,
    /// Minimum spacing between SESSION_REQUEST sends to one peer
    pub session_request_min_interval: Duration,
    /// Default HELLO round-trip deadline
    pub hello_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cipher_suites: CipherSuite::default_capabilities(),
            elliptic_curves: EllipticCurve::default_capabilities(),
            accept_hello_messages: true,
            accept_session_requests: true,
            accept_sessions: true,
            keep_alive_period: SESSION_KEEP_ALIVE_PERIOD,
            session_timeout: SESSION_TIMEOUT,
            session_age: SESSION_AGE,
            sequence_threshold: SEQUENCE_THRESHOLD,
            session_request_min_interval: SESSION_REQUEST_MIN_INTERVAL,
            hello_timeout: HELLO_TIMEOUT,
        }
    }
}

/// Callbacks surfaced by the server.
///
/// Decision hooks receive the configured default and may override it; event
/// hooks are informational. Every method has a default implementation so
/// embedders only override what they need.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    async fn on_hello_received(&self, _sender: SocketAddr, default_accept: bool) -> bool {
        default_accept
    }

    async fn on_presentation_received(
        &self,
        _sender: SocketAddr,
        _certificate: &SignatureCertificate,
        _status: PresentationStatus,
        has_session: bool,
    ) -> bool {
        !has_session
    }

    async fn on_session_request_received(
        &self,
        _sender: SocketAddr,
        _cipher_suites: &[CipherSuite],
        _elliptic_curves: &[EllipticCurve],
        default_accept: bool,
    ) -> bool {
        default_accept
    }

    async fn on_session_received(
        &self,
        _sender: SocketAddr,
        _cipher_suite: CipherSuite,
        _elliptic_curve: EllipticCurve,
        default_accept: bool,
    ) -> bool {
        default_accept
    }

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

    async fn on_data_received(&self, _sender: SocketAddr, _channel: u8, _data: Bytes) {}

    async fn on_contact_request_received(
        &self,
        _sender: SocketAddr,
        _certificate: &SignatureCertificate,
        _hash: CertificateHash,
        _answer: SocketAddr,
    ) -> bool {
        true
    }

    async fn on_contact_received(
        &self,
        _sender: SocketAddr,
        _hash: CertificateHash,
        _answer: SocketAddr,
    ) {
    }

    /// The receive loop hit a fatal socket error and the server went offline
    async fn on_server_closed(&self) {}
}

enum ServerEvent {
    Established {
        endpoint: SocketAddr,
        is_new: bool,
        cipher_suite: CipherSuite,
        elliptic_curve: EllipticCurve,
    },
    Failed {
        endpoint: SocketAddr,
        is_new: bool,
    },
    Error {
        endpoint: SocketAddr,
        is_new: bool,
        error: FscpError,
    },
    Lost {
        endpoint: SocketAddr,
        reason: SessionLossReason,
    },
}

/// The FSCP server
pub struct Server {
    config: ServerConfig,
    local_addr: SocketAddr,
    handler: Arc<dyn ServerHandler>,
    presentations: Arc<PresentationStore>,
    sessions: Mutex<HashMap<SocketAddr, PeerSession>>,
    greeter: Greeter,
    /// Dropped on close so the writer task drains what is queued and stops
    write_queue: std::sync::Mutex<Option<mpsc::Sender<(Bytes, SocketAddr)>>>,
    offline: AtomicBool,
    shutdown: Arc<Notify>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Map an IPv4-mapped IPv6 endpoint to its plain IPv4 form so both spellings
/// key the same peer state.
pub fn normalize(endpoint: SocketAddr) -> SocketAddr {
    match endpoint {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(v4.into(), v6.port()),
            None => endpoint,
        },
        SocketAddr::V4(_) => endpoint,
    }
}

fn bind_socket(listen_on: SocketAddr) -> FscpResult<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if listen_on.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if listen_on.is_ipv6() {
        // Dual-stack: IPv4 peers appear as v4-mapped addresses.
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&listen_on.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

impl Server {
    /// Bind the socket and start the receive, write and keep-alive tasks
    pub async fn open(
        listen_on: SocketAddr,
        config: ServerConfig,
        identity: Identity,
        handler: Arc<dyn ServerHandler>,
    ) -> FscpResult<Arc<Self>> {
        let socket = Arc::new(bind_socket(listen_on)?);
        let local_addr = socket.local_addr()?;
        info!("FSCP server listening on {}", local_addr);

        let (write_tx, write_rx) = mpsc::channel::<(Bytes, SocketAddr)>(1024);
        let shutdown = Arc::new(Notify::new());

        let server = Arc::new(Self {
            config,
            local_addr,
            handler,
            presentations: Arc::new(PresentationStore::new(identity)),
            sessions: Mutex::new(HashMap::new()),
            greeter: Greeter::new(),
            write_queue: std::sync::Mutex::new(Some(write_tx)),
            offline: AtomicBool::new(false),
            shutdown: shutdown.clone(),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        // The writer task is not tracked for abort: it terminates by itself
        // once the queue sender is dropped, after draining what was queued.
        tokio::spawn(Self::write_loop(socket.clone(), write_rx));
        let recv_task = tokio::spawn(Self::receive_loop(server.clone(), socket));
        let keep_alive_task = tokio::spawn(Self::keep_alive_loop(server.clone()));

        server
            .tasks
            .lock()
            .expect("task list lock")
            .extend([recv_task, keep_alive_task]);

        Ok(server)
    }

    /// The bound socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The identity and presentation store
    pub fn presentation_store(&self) -> &PresentationStore {
        &self.presentations
    }

    /// Whether the server has been closed
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Stop the server: cancel timers and pending greets, drain the write
    /// queue and stop the receive loop.
    pub async fn close(&self) {
        if self.offline.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("FSCP server on {} closing", self.local_addr);

        self.greeter.cancel_all().await;
        self.shutdown.notify_waiters();
        // Dropping the sender lets the writer drain the queue and stop.
        self.write_queue.lock().expect("write queue lock").take();

        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task list lock"));
        for task in tasks {
            task.abort();
        }
    }

    // =====================
    // Background tasks
    // =====================

    async fn write_loop(socket: Arc<UdpSocket>, mut queue: mpsc::Receiver<(Bytes, SocketAddr)>) {
        // One send at a time, in queue order. After close() drops the
        // sender, recv() yields the remaining queued datagrams and then
        // None, so the queue is drained before the task stops.
        while let Some((bytes, target)) = queue.recv().await {
            if let Err(error) = socket.send_to(&bytes, target).await {
                debug!("UDP send to {} failed: {}", target, error);
            }
        }
    }

    async fn receive_loop(server: Arc<Server>, socket: Arc<UdpSocket>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((length, sender)) => {
                    let datagram = Bytes::copy_from_slice(&buffer[..length]);
                    server.handle_datagram(normalize(sender), datagram).await;
                }
                Err(error) => {
                    if server.is_offline() {
                        break;
                    }
                    match error.kind() {
                        std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::WouldBlock => {
                            // A peer went away between our send and its ICMP
                            // answer; nothing to attribute, keep receiving.
                            debug!("transient receive error: {}", error);
                        }
                        _ => {
                            warn!("fatal socket error, closing server: {}", error);
                            server.offline.store(true, Ordering::SeqCst);
                            server.shutdown.notify_waiters();
                            server.handler.on_server_closed().await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn keep_alive_loop(server: Arc<Server>) {
        let mut ticker = tokio::time::interval(server.config.keep_alive_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => server.keep_alive_tick().await,
                _ = server.shutdown.notified() => break,
            }
        }
    }

    async fn keep_alive_tick(&self) {
        let mut events = Vec::new();
        let mut outbound = Vec::new();

        {
            let mut sessions = self.sessions.lock().await;
            for (endpoint, session) in sessions.iter_mut() {
                if !session.has_current_session() {
                    continue;
                }

                if session.has_timed_out(self.config.session_timeout) {
                    session.clear();
                    events.push(ServerEvent::Lost {
                        endpoint: *endpoint,
                        reason: SessionLossReason::Timeout,
                    });
                    continue;
                }

                let mut padding = vec![0u8; KEEP_ALIVE_DATA_SIZE];
                rand::rngs::OsRng.fill_bytes(&mut padding);
                match session.seal_data(*endpoint, DataKind::KeepAlive, &padding) {
                    Ok(message) => outbound.push((Message::Data(message).to_bytes(), *endpoint)),
                    Err(FscpError::SequenceNumberExhausted(_)) => {
                        session.clear();
                        events.push(ServerEvent::Lost {
                            endpoint: *endpoint,
                            reason: SessionLossReason::ManualTermination,
                        });
                    }
                    Err(error) => debug!("keep-alive for {} failed: {}", endpoint, error),
                }
            }
        }

        for (bytes, target) in outbound {
            let _ = self.enqueue_bytes(bytes, target).await;
        }
        self.fire(events).await;
    }

    // =====================
    // Outbound API
    // =====================

    async fn enqueue_bytes(&self, bytes: Bytes, target: SocketAddr) -> FscpResult<()> {
        if self.is_offline() {
            return Err(FscpError::ServerOffline);
        }
        let sender = self
            .write_queue
            .lock()
            .expect("write queue lock")
            .clone()
            .ok_or(FscpError::ServerOffline)?;
        sender
            .send((bytes, target))
            .await
            .map_err(|_| FscpError::ServerOffline)
    }

    async fn enqueue(&self, message: &Message, target: SocketAddr) -> FscpResult<()> {
        self.enqueue_bytes(message.to_bytes(), target).await
    }

    /// Send a HELLO_REQUEST and wait for the matching response
    pub async fn greet(&self, target: SocketAddr, timeout: Duration) -> FscpResult<Duration> {
        let target = normalize(target);
        if self.is_offline() {
            return Err(FscpError::ServerOffline);
        }

        let (unique_number, wait) = self.greeter.register(target).await;
        self.enqueue(&Message::HelloRequest { unique_number }, target)
            .await?;

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(rtt)) => Ok(rtt),
            Ok(Err(_)) => Err(FscpError::ServerOffline),
            Err(_) => {
                self.greeter.forget(unique_number).await;
                Err(FscpError::HelloRequestTimedOut)
            }
        }
    }

    /// Send our PRESENTATION to a peer
    pub async fn introduce_to(&self, target: SocketAddr) -> FscpResult<()> {
        let target = normalize(target);
        let identity = self.presentations.local_identity().await;
        self.enqueue(
            &Message::Presentation {
                certificate: Bytes::copy_from_slice(identity.certificate().der()),
            },
            target,
        )
        .await
    }

    /// Re-send our PRESENTATION to every endpoint we know
    pub async fn reintroduce_to_all(&self) -> FscpResult<()> {
        for endpoint in self.presentations.endpoints().await {
            self.introduce_to(endpoint).await?;
        }
        Ok(())
    }

    /// Swap the local identity and re-present it to all known endpoints
    pub async fn set_local_identity(&self, identity: Identity) -> FscpResult<()> {
        self.presentations.set_local_identity(identity).await;
        self.reintroduce_to_all().await
    }

    /// Start a session handshake with a peer
    pub async fn request_session(&self, target: SocketAddr) -> FscpResult<()> {
        let target = normalize(target);
        if self.is_offline() {
            return Err(FscpError::ServerOffline);
        }
        let identity = self.presentations.local_identity().await;

        let message = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.entry(target).or_default();

            if session.has_current_session() {
                return Err(FscpError::SessionAlreadyExist(target));
            }
            if !session.may_request_session(self.config.session_request_min_interval) {
                debug!("session request to {} suppressed by rate cap", target);
                return Ok(());
            }

            Message::SessionRequest(SessionRequestMessage::new_signed(
                session.next_session_number(),
                session.local_host_identifier(),
                self.config.cipher_suites.clone(),
                self.config.elliptic_curves.clone(),
                &identity,
            ))
        };

        self.enqueue(&message, target).await
    }

    /// Terminate the session with a peer
    pub async fn close_session(&self, target: SocketAddr) -> FscpResult<()> {
        let target = normalize(target);
        let cleared = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .get_mut(&target)
                .map(|session| session.clear())
                .unwrap_or(false)
        };

        if cleared {
            self.fire(vec![ServerEvent::Lost {
                endpoint: target,
                reason: SessionLossReason::ManualTermination,
            }])
            .await;
            Ok(())
        } else {
            Err(FscpError::NoSessionForHost(target))
        }
    }

    /// Send application data on a channel
    pub async fn send_data(&self, target: SocketAddr, channel: u8, data: &[u8]) -> FscpResult<()> {
        if channel >= CHANNEL_COUNT {
            return Err(FscpError::MalformedMessage(format!(
                "channel {} out of range",
                channel
            )));
        }
        self.send_sealed(normalize(target), DataKind::Channel(channel), data)
            .await
    }

    /// Send application data to a list of peers; failures are logged
    pub async fn send_data_to_list(
        &self,
        targets: &[SocketAddr],
        channel: u8,
        data: &[u8],
    ) -> FscpResult<()> {
        for target in targets {
            if let Err(error) = self.send_data(*target, channel, data).await {
                debug!("send to {} failed: {}", target, error);
            }
        }
        Ok(())
    }

    /// Send application data to every peer with a session
    pub async fn send_data_to_all(&self, channel: u8, data: &[u8]) -> FscpResult<()> {
        let targets = self.session_endpoints().await;
        self.send_data_to_list(&targets, channel, data).await
    }

    /// Send a CONTACT_REQUEST carrying certificate hashes
    pub async fn send_contact_request(
        &self,
        target: SocketAddr,
        hashes: &[CertificateHash],
    ) -> FscpResult<()> {
        self.send_sealed(
            normalize(target),
            DataKind::ContactRequest,
            &write_hash_list(hashes),
        )
        .await
    }

    /// Send a CONTACT_REQUEST to every peer with a session
    pub async fn send_contact_request_to_all(&self, hashes: &[CertificateHash]) -> FscpResult<()> {
        for target in self.session_endpoints().await {
            if let Err(error) = self.send_contact_request(target, hashes).await {
                debug!("contact request to {} failed: {}", target, error);
            }
        }
        Ok(())
    }

    /// Send a CONTACT answer mapping hashes to endpoints
    pub async fn send_contact(
        &self,
        target: SocketAddr,
        contacts: &[(CertificateHash, SocketAddr)],
    ) -> FscpResult<()> {
        self.send_sealed(
            normalize(target),
            DataKind::Contact,
            &write_contact_map(contacts),
        )
        .await
    }

    async fn send_sealed(
        &self,
        target: SocketAddr,
        kind: DataKind,
        plaintext: &[u8],
    ) -> FscpResult<()> {
        if self.is_offline() {
            return Err(FscpError::ServerOffline);
        }

        let sealed = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(&target)
                .ok_or(FscpError::NoSessionForHost(target))?;
            match session.seal_data(target, kind, plaintext) {
                Ok(message) => Ok(message),
                Err(FscpError::SequenceNumberExhausted(endpoint)) => {
                    // The nonce space is spent; never wrap, drop the session.
                    session.clear();
                    Err(FscpError::SequenceNumberExhausted(endpoint))
                }
                Err(error) => Err(error),
            }
        };

        match sealed {
            Ok(message) => self.enqueue(&Message::Data(message), target).await,
            Err(error @ FscpError::SequenceNumberExhausted(_)) => {
                self.fire(vec![ServerEvent::Lost {
                    endpoint: target,
                    reason: SessionLossReason::ManualTermination,
                }])
                .await;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Every endpoint with an established session
    pub async fn session_endpoints(&self) -> Vec<SocketAddr> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|(_, session)| session.has_current_session())
            .map(|(endpoint, _)| *endpoint)
            .collect()
    }

    /// Whether a session is established with the endpoint
    pub async fn has_session_with(&self, endpoint: SocketAddr) -> bool {
        self.sessions
            .lock()
            .await
            .get(&normalize(endpoint))
            .map(|session| session.has_current_session())
            .unwrap_or(false)
    }

    // =====================
    // Inbound dispatch
    // =====================

    async fn handle_datagram(&self, sender: SocketAddr, datagram: Bytes) {
        let message = match Message::from_bytes(datagram) {
            Ok(message) => message,
            Err(error) => {
                debug!("dropping malformed datagram from {}: {}", sender, error);
                return;
            }
        };

        match message {
            Message::HelloRequest { unique_number } => {
                self.handle_hello_request(sender, unique_number).await
            }
            Message::HelloResponse { unique_number } => {
                self.greeter.complete(sender, unique_number).await
            }
            Message::Presentation { certificate } => {
                self.handle_presentation(sender, &certificate).await
            }
            Message::SessionRequest(request) => self.handle_session_request(sender, request).await,
            Message::Session(session) => self.handle_session(sender, session).await,
            Message::Data(data) => self.handle_data(sender, data).await,
        }
    }

    async fn handle_hello_request(&self, sender: SocketAddr, unique_number: u32) {
        trace!("HELLO_REQUEST from {}", sender);
        let accept = self
            .handler
            .on_hello_received(sender, self.config.accept_hello_messages)
            .await;
        if accept {
            let _ = self
                .enqueue(&Message::HelloResponse { unique_number }, sender)
                .await;
        }
    }

    async fn handle_presentation(&self, sender: SocketAddr, der: &[u8]) {
        let certificate = match SignatureCertificate::from_der(der) {
            Ok(certificate) => certificate,
            Err(error) => {
                debug!("dropping bad PRESENTATION from {}: {}", sender, error);
                return;
            }
        };

        let status = self.presentations.status_of(sender, &certificate).await;
        let has_session = self.has_session_with(sender).await;
        let accept = self
            .handler
            .on_presentation_received(sender, &certificate, status, has_session)
            .await;

        if accept {
            debug!(
                "accepting PRESENTATION from {} ({}, {:?})",
                sender,
                certificate.subject(),
                status
            );
            self.presentations.set_presentation(sender, certificate).await;
        } else {
            debug!("refusing PRESENTATION from {}", sender);
        }
    }

    async fn handle_session_request(&self, sender: SocketAddr, request: SessionRequestMessage) {
        let certificate = match self.presentations.get_presentation(sender).await {
            Some(certificate) => certificate,
            None => {
                debug!("SESSION_REQUEST from {} without presentation", sender);
                return;
            }
        };
        if request.verify_signature(&certificate).is_err() {
            debug!("SESSION_REQUEST from {} has an invalid signature", sender);
            return;
        }

        let can_reply = self
            .handler
            .on_session_request_received(
                sender,
                &request.cipher_suites,
                &request.elliptic_curves,
                self.config.accept_session_requests,
            )
            .await;

        let identity = self.presentations.local_identity().await;
        let mut events = Vec::new();
        let mut reply = None;

        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.entry(sender).or_default();

            if !session.set_first_remote_host_identifier(request.host_identifier) {
                debug!("host identifier mismatch in SESSION_REQUEST from {}", sender);
                return;
            }

            let cipher_suite = first_common_cipher_suite(
                &self.config.cipher_suites,
                &request.cipher_suites,
            );
            let elliptic_curve = first_common_elliptic_curve(
                &self.config.elliptic_curves,
                &request.elliptic_curves,
            );
            let (cipher_suite, elliptic_curve) = match (cipher_suite, elliptic_curve) {
                (Some(cs), Some(ec)) => (cs, ec),
                _ => {
                    debug!("no suitable cipher suite or curve for {}", sender);
                    events.push(ServerEvent::Failed {
                        endpoint: sender,
                        is_new: !session.has_current_session(),
                    });
                    drop(sessions);
                    self.fire(events).await;
                    return;
                }
            };

            if can_reply {
                let use_next = match session.current_session() {
                    None => true,
                    Some(current) => request.session_number > current.session_number,
                };

                if use_next {
                    match session.prepare_session(
                        request.session_number,
                        cipher_suite,
                        elliptic_curve,
                    ) {
                        Ok(()) => {
                            let prepared =
                                session.next_session().expect("session prepared above");
                            reply = Some(Message::Session(SessionMessage::new_signed(
                                prepared.session_number,
                                session.local_host_identifier(),
                                prepared.cipher_suite,
                                prepared.elliptic_curve,
                                Bytes::copy_from_slice(prepared.public_key()),
                                &identity,
                            )));
                        }
                        Err(error) => {
                            events.push(ServerEvent::Error {
                                endpoint: sender,
                                is_new: !session.has_current_session(),
                                error,
                            });
                        }
                    }
                } else if let Some(current) = session.current_session() {
                    // An old session was requested: answer with the current
                    // parameters so the peer can converge.
                    reply = Some(Message::Session(SessionMessage::new_signed(
                        current.session_number,
                        session.local_host_identifier(),
                        current.cipher_suite,
                        current.elliptic_curve,
                        current.local_public_key().clone(),
                        &identity,
                    )));
                }
            }
        }

        if let Some(message) = reply {
            let _ = self.enqueue(&message, sender).await;
        }
        self.fire(events).await;
    }

    async fn handle_session(&self, sender: SocketAddr, message: SessionMessage) {
        let certificate = match self.presentations.get_presentation(sender).await {
            Some(certificate) => certificate,
            None => {
                debug!("SESSION from {} without presentation", sender);
                return;
            }
        };
        if message.verify_signature(&certificate).is_err() {
            debug!("SESSION from {} has an invalid signature", sender);
            return;
        }

        let can_accept = self
            .handler
            .on_session_received(
                sender,
                message.cipher_suite,
                message.elliptic_curve,
                self.config.accept_sessions,
            )
            .await;

        let identity = self.presentations.local_identity().await;
        let mut events = Vec::new();
        let mut outbound = Vec::new();

        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.entry(sender).or_default();

            if !session.set_first_remote_host_identifier(message.host_identifier) {
                debug!("host identifier mismatch in SESSION from {}", sender);
                return;
            }

            let is_new = !session.has_current_session();

            if let Some(current) = session.current_session() {
                if message.session_number == current.session_number {
                    if message.cipher_suite != current.cipher_suite {
                        // The peer converged on different parameters for the
                        // same epoch; negotiate a fresh one, rate-capped so
                        // two disagreeing peers cannot ping-pong forever.
                        if session.may_request_session(self.config.session_request_min_interval) {
                            outbound.push(Message::SessionRequest(
                                SessionRequestMessage::new_signed(
                                    session.next_session_number(),
                                    session.local_host_identifier(),
                                    self.config.cipher_suites.clone(),
                                    self.config.elliptic_curves.clone(),
                                    &identity,
                                ),
                            ));
                        }
                    } else {
                        trace!("duplicate SESSION from {}", sender);
                    }
                    drop(sessions);
                    for message in outbound {
                        let _ = self.enqueue(&message, sender).await;
                    }
                    return;
                } else if message.session_number < current.session_number {
                    debug!("stale SESSION {} from {}", message.session_number, sender);
                    return;
                }
            }

            if !message.cipher_suite.is_usable() || !message.elliptic_curve.is_usable() {
                debug!("SESSION from {} with unusable parameters", sender);
                events.push(ServerEvent::Failed {
                    endpoint: sender,
                    is_new,
                });
                drop(sessions);
                self.fire(events).await;
                return;
            }

            if can_accept {
                // Prepare for exactly the announced epoch. This is a no-op
                // when a matching keypair is already prepared and replaces a
                // mismatched one, so crossed handshakes converge on the same
                // parameters.
                let completed = session
                    .prepare_session(
                        message.session_number,
                        message.cipher_suite,
                        message.elliptic_curve,
                    )
                    .and_then(|()| {
                        session.complete_session(&message.public_key, message.host_identifier)
                    });

                match completed {
                    Ok(true) => {
                        let current = session
                            .current_session()
                            .expect("session completed above");
                        outbound.push(Message::Session(SessionMessage::new_signed(
                            current.session_number,
                            session.local_host_identifier(),
                            current.cipher_suite,
                            current.elliptic_curve,
                            current.local_public_key().clone(),
                            &identity,
                        )));
                        events.push(ServerEvent::Established {
                            endpoint: sender,
                            is_new,
                            cipher_suite: current.cipher_suite,
                            elliptic_curve: current.elliptic_curve,
                        });
                    }
                    Ok(false) => {
                        debug!("unable to complete session with {}", sender);
                    }
                    Err(error) => {
                        events.push(ServerEvent::Error {
                            endpoint: sender,
                            is_new,
                            error,
                        });
                    }
                }
            }
        }

        for message in outbound {
            let _ = self.enqueue(&message, sender).await;
        }
        self.fire(events).await;
    }

    async fn handle_data(&self, sender: SocketAddr, message: DataMessage) {
        let identity = self.presentations.local_identity().await;
        let mut rekey = None;

        let plaintext = {
            let mut sessions = self.sessions.lock().await;
            let session = match sessions.get_mut(&sender) {
                Some(session) => session,
                None => {
                    trace!("data from {} without peer state", sender);
                    return;
                }
            };

            let plaintext = match session.open_data(&message) {
                OpenOutcome::Plaintext(plaintext) => plaintext,
                OpenOutcome::NoSession => {
                    trace!("data from {} without session", sender);
                    return;
                }
                OpenOutcome::Replayed => {
                    debug!(
                        "replayed or out-of-order frame {} from {}",
                        message.sequence_number, sender
                    );
                    return;
                }
                OpenOutcome::Failed => {
                    // Expected right after a rekey, when frames sealed under
                    // the previous keys are still in flight.
                    debug!("undecryptable frame from {}", sender);
                    return;
                }
            };

            let needs_rekey = session
                .current_session()
                .map(|current| {
                    current.is_old(self.config.session_age, self.config.sequence_threshold)
                })
                .unwrap_or(false);
            if needs_rekey && session.next_session().is_none() {
                if let Some(current) = session.current_session() {
                    let next_number = current.session_number + 1;
                    let (cipher_suite, elliptic_curve) =
                        (current.cipher_suite, current.elliptic_curve);
                    match session.prepare_session(next_number, cipher_suite, elliptic_curve) {
                        Ok(()) => {
                            let prepared =
                                session.next_session().expect("session prepared above");
                            rekey = Some(Message::Session(SessionMessage::new_signed(
                                prepared.session_number,
                                session.local_host_identifier(),
                                prepared.cipher_suite,
                                prepared.elliptic_curve,
                                Bytes::copy_from_slice(prepared.public_key()),
                                &identity,
                            )));
                        }
                        Err(error) => {
                            debug!("rekey preparation for {} failed: {}", sender, error)
                        }
                    }
                }
            }

            plaintext
        };

        if let Some(message) = rekey {
            debug!("session with {} is old, rekeying", sender);
            let _ = self.enqueue(&message, sender).await;
        }

        match message.kind {
            DataKind::KeepAlive => {}
            DataKind::Channel(channel) => {
                self.handler
                    .on_data_received(sender, channel, Bytes::from(plaintext))
                    .await;
            }
            DataKind::ContactRequest => self.handle_contact_request(sender, &plaintext).await,
            DataKind::Contact => self.handle_contact(sender, &plaintext).await,
        }
    }

    async fn handle_contact_request(&self, sender: SocketAddr, plaintext: &[u8]) {
        let hashes = match parse_hash_list(plaintext) {
            Ok(hashes) => hashes,
            Err(error) => {
                debug!("bad contact request from {}: {}", sender, error);
                return;
            }
        };

        let mut contacts = Vec::new();
        for hash in hashes {
            for (endpoint, certificate) in self.presentations.find_by_hash(&hash).await {
                if endpoint == sender {
                    continue;
                }
                let share = self
                    .handler
                    .on_contact_request_received(sender, &certificate, hash, endpoint)
                    .await;
                if share {
                    contacts.push((hash, endpoint));
                }
            }
        }

        if !contacts.is_empty() {
            let _ = self.send_contact(sender, &contacts).await;
        }
    }

    async fn handle_contact(&self, sender: SocketAddr, plaintext: &[u8]) {
        let contacts = match parse_contact_map(plaintext) {
            Ok(contacts) => contacts,
            Err(error) => {
                debug!("bad contact message from {}: {}", sender, error);
                return;
            }
        };

        for (hash, endpoint) in contacts {
            self.handler
                .on_contact_received(sender, hash, normalize(endpoint))
                .await;
        }
    }

    async fn fire(&self, events: Vec<ServerEvent>) {
        for event in events {
            match event {
                ServerEvent::Established {
                    endpoint,
                    is_new,
                    cipher_suite,
                    elliptic_curve,
                } => {
                    if is_new {
                        info!("session established with {}", endpoint);
                    } else {
                        info!("session renewed with {}", endpoint);
                    }
                    self.handler
                        .on_session_established(endpoint, is_new, cipher_suite, elliptic_curve)
                        .await;
                }
                ServerEvent::Failed { endpoint, is_new } => {
                    warn!(
                        "session {} with {} failed",
                        if is_new { "establishment" } else { "renewal" },
                        endpoint
                    );
                    self.handler.on_session_failed(endpoint, is_new).await;
                }
                ServerEvent::Error {
                    endpoint,
                    is_new,
                    error,
                } => {
                    warn!("session with {} hit an error: {}", endpoint, error);
                    self.handler
                        .on_session_error(endpoint, is_new, error)
                        .await;
                }
                ServerEvent::Lost { endpoint, reason } => {
                    info!("session with {} lost ({})", endpoint, reason);
                    self.handler.on_session_lost(endpoint, reason).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    #[derive(Debug)]
    enum TestEvent {
        Established { is_new: bool },
        Failed,
        Lost { reason: SessionLossReason },
        Data { channel: u8, data: Bytes },
        Contact { answer: SocketAddr },
    }

    struct TestHandler {
        events: UnboundedSender<TestEvent>,
    }

    #[async_trait]
    impl ServerHandler for TestHandler {
        async fn on_session_established(
            &self,
            _endpoint: SocketAddr,
            is_new: bool,
            _cipher_suite: CipherSuite,
            _elliptic_curve: EllipticCurve,
        ) {
            let _ = self.events.send(TestEvent::Established { is_new });
        }

        async fn on_session_failed(&self, _endpoint: SocketAddr, _is_new: bool) {
            let _ = self.events.send(TestEvent::Failed);
        }

        async fn on_session_lost(&self, _endpoint: SocketAddr, reason: SessionLossReason) {
            let _ = self.events.send(TestEvent::Lost { reason });
        }

        async fn on_data_received(&self, _sender: SocketAddr, channel: u8, data: Bytes) {
            let _ = self.events.send(TestEvent::Data { channel, data });
        }

        async fn on_contact_received(
            &self,
            _sender: SocketAddr,
            _hash: CertificateHash,
            answer: SocketAddr,
        ) {
            let _ = self.events.send(TestEvent::Contact { answer });
        }
    }

    async fn spawn_server(
        name: &str,
        config: ServerConfig,
    ) -> (Arc<Server>, UnboundedReceiver<TestEvent>) {
        let (tx, rx) = unbounded_channel();
        let server = Server::open(
            "127.0.0.1:0".parse().unwrap(),
            config,
            Identity::generate(name),
            Arc::new(TestHandler { events: tx }),
        )
        .await
        .unwrap();
        (server, rx)
    }

    async fn next_event(rx: &mut UnboundedReceiver<TestEvent>) -> TestEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_established(rx: &mut UnboundedReceiver<TestEvent>) -> bool {
        loop {
            if let TestEvent::Established { is_new } = next_event(rx).await {
                return is_new;
            }
        }
    }

    /// Exchange presentations and wait until both stores are populated.
    async fn exchange_presentations(a: &Arc<Server>, b: &Arc<Server>) {
        a.introduce_to(b.local_addr()).await.unwrap();
        b.introduce_to(a.local_addr()).await.unwrap();

        for _ in 0..100 {
            let a_knows_b = a
                .presentation_store()
                .get_presentation(b.local_addr())
                .await
                .is_some();
            let b_knows_a = b
                .presentation_store()
                .get_presentation(a.local_addr())
                .await
                .is_some();
            if a_knows_b && b_knows_a {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("presentation exchange did not converge");
    }

    async fn establish(
        a: &Arc<Server>,
        a_events: &mut UnboundedReceiver<TestEvent>,
        b: &Arc<Server>,
        b_events: &mut UnboundedReceiver<TestEvent>,
    ) {
        exchange_presentations(a, b).await;
        a.request_session(b.local_addr()).await.unwrap();

        assert!(wait_established(a_events).await);
        assert!(wait_established(b_events).await);
        assert!(a.has_session_with(b.local_addr()).await);
        assert!(b.has_session_with(a.local_addr()).await);
    }

    #[tokio::test]
    async fn test_handshake_and_data() {
        let (a, mut a_events) = spawn_server("alice", ServerConfig::default()).await;
        let (b, mut b_events) = spawn_server("bob", ServerConfig::default()).await;

        establish(&a, &mut a_events, &b, &mut b_events).await;

        a.send_data(b.local_addr(), 0, b"hello").await.unwrap();
        match next_event(&mut b_events).await {
            TestEvent::Data { channel, data } => {
                assert_eq!(channel, 0);
                assert_eq!(data, Bytes::from_static(b"hello"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // And the other direction.
        b.send_data(a.local_addr(), 1, b"world").await.unwrap();
        match next_event(&mut a_events).await {
            TestEvent::Data { channel, data } => {
                assert_eq!(channel, 1);
                assert_eq!(data, Bytes::from_static(b"world"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_greet_round_trip() {
        let (a, _a_events) = spawn_server("alice", ServerConfig::default()).await;
        let (b, _b_events) = spawn_server("bob", ServerConfig::default()).await;

        let rtt = a
            .greet(b.local_addr(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(rtt < Duration::from_secs(5));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_greet_timeout() {
        let (a, _a_events) = spawn_server("alice", ServerConfig::default()).await;

        // An endpoint nobody answers on.
        let silent: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = a.greet(silent, Duration::from_millis(300)).await;
        assert!(matches!(result, Err(FscpError::HelloRequestTimedOut)));

        a.close().await;
    }

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let (a, _a_events) = spawn_server("alice", ServerConfig::default()).await;
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();

        assert!(matches!(
            a.send_data(target, 0, b"x").await,
            Err(FscpError::NoSessionForHost(_))
        ));

        a.close().await;
    }

    #[tokio::test]
    async fn test_session_request_before_presentation_dropped() {
        let (a, _a_events) = spawn_server("alice", ServerConfig::default()).await;

        // A bare client that never presented itself.
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let identity = Identity::generate("stranger");
        let request = Message::SessionRequest(SessionRequestMessage::new_signed(
            1,
            crate::message::HostIdentifier::random(),
            CipherSuite::default_capabilities(),
            EllipticCurve::default_capabilities(),
            &identity,
        ));
        client
            .send_to(&request.to_bytes(), a.local_addr())
            .await
            .unwrap();

        // No SESSION comes back.
        let mut buffer = [0u8; 2048];
        let reply = tokio::time::timeout(
            Duration::from_millis(500),
            client.recv_from(&mut buffer),
        )
        .await;
        assert!(reply.is_err());

        a.close().await;
    }

    #[tokio::test]
    async fn test_forged_session_request_rejected_then_legitimate_accepted() {
        let (a, _a_events) = spawn_server("alice", ServerConfig::default()).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob = Identity::generate("bob");
        let mallory = Identity::generate("mallory");

        // Present Bob's certificate from the client endpoint.
        let presentation = Message::Presentation {
            certificate: Bytes::copy_from_slice(bob.certificate().der()),
        };
        client
            .send_to(&presentation.to_bytes(), a.local_addr())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // A request signed by Mallory must be dropped without a reply.
        let host_identifier = crate::message::HostIdentifier::random();
        let forged = Message::SessionRequest(SessionRequestMessage::new_signed(
            1,
            host_identifier,
            CipherSuite::default_capabilities(),
            EllipticCurve::default_capabilities(),
            &mallory,
        ));
        client
            .send_to(&forged.to_bytes(), a.local_addr())
            .await
            .unwrap();

        let mut buffer = [0u8; 2048];
        let reply = tokio::time::timeout(
            Duration::from_millis(500),
            client.recv_from(&mut buffer),
        )
        .await;
        assert!(reply.is_err(), "forged request must not be answered");

        // The legitimate request from the same endpoint succeeds.
        let legitimate = Message::SessionRequest(SessionRequestMessage::new_signed(
            1,
            host_identifier,
            CipherSuite::default_capabilities(),
            EllipticCurve::default_capabilities(),
            &bob,
        ));
        client
            .send_to(&legitimate.to_bytes(), a.local_addr())
            .await
            .unwrap();

        let (length, _) = tokio::time::timeout(
            Duration::from_secs(5),
            client.recv_from(&mut buffer),
        )
        .await
        .expect("legitimate request must be answered")
        .unwrap();
        match Message::from_bytes(Bytes::copy_from_slice(&buffer[..length])).unwrap() {
            Message::Session(session) => assert_eq!(session.session_number, 1),
            other => panic!("expected SESSION, got {:?}", other),
        }

        a.close().await;
    }

    #[tokio::test]
    async fn test_manual_close_session() {
        let (a, mut a_events) = spawn_server("alice", ServerConfig::default()).await;
        let (b, mut b_events) = spawn_server("bob", ServerConfig::default()).await;

        establish(&a, &mut a_events, &b, &mut b_events).await;

        a.close_session(b.local_addr()).await.unwrap();
        match next_event(&mut a_events).await {
            TestEvent::Lost { reason } => {
                assert_eq!(reason, SessionLossReason::ManualTermination)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!a.has_session_with(b.local_addr()).await);

        // Closing again reports the absence.
        assert!(matches!(
            a.close_session(b.local_addr()).await,
            Err(FscpError::NoSessionForHost(_))
        ));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_session_timeout_fires_lost() {
        let mut config = ServerConfig::default();
        config.keep_alive_period = Duration::from_millis(100);
        config.session_timeout = Duration::from_millis(500);

        let (a, mut a_events) = spawn_server("alice", config.clone()).await;
        let (b, mut b_events) = spawn_server("bob", config).await;

        establish(&a, &mut a_events, &b, &mut b_events).await;

        // Kill Bob so his keep-alives stop.
        b.close().await;

        loop {
            match next_event(&mut a_events).await {
                TestEvent::Lost { reason } => {
                    assert_eq!(reason, SessionLossReason::Timeout);
                    break;
                }
                _ => continue,
            }
        }
        assert!(!a.has_session_with(b.local_addr()).await);

        a.close().await;
    }

    #[tokio::test]
    async fn test_rekey_under_age() {
        let mut config = ServerConfig::default();
        config.session_age = Duration::from_millis(300);

        let (a, mut a_events) = spawn_server("alice", config.clone()).await;
        let (b, mut b_events) = spawn_server("bob", config).await;

        establish(&a, &mut a_events, &b, &mut b_events).await;

        // Let the session age past the limit, then poke it.
        tokio::time::sleep(Duration::from_millis(400)).await;
        a.send_data(b.local_addr(), 0, b"poke").await.unwrap();

        // Both sides renew: session_established(is_new = false).
        assert!(!wait_established(&mut a_events).await);
        assert!(!wait_established(&mut b_events).await);

        // Frames still flow under the new epoch.
        a.send_data(b.local_addr(), 0, b"after rekey").await.unwrap();
        loop {
            match next_event(&mut b_events).await {
                TestEvent::Data { data, .. } => {
                    assert_eq!(data, Bytes::from_static(b"after rekey"));
                    break;
                }
                _ => continue,
            }
        }

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_no_common_cipher_fails_session() {
        let mut a_config = ServerConfig::default();
        a_config.cipher_suites = vec![CipherSuite::EcdheRsaAes256GcmSha384];
        let mut b_config = ServerConfig::default();
        b_config.cipher_suites = vec![CipherSuite::EcdheRsaAes128GcmSha256];

        let (a, _a_events) = spawn_server("alice", a_config).await;
        let (b, mut b_events) = spawn_server("bob", b_config).await;

        exchange_presentations(&a, &b).await;
        a.request_session(b.local_addr()).await.unwrap();

        // Bob cannot find a common suite and reports the failure.
        match next_event(&mut b_events).await {
            TestEvent::Failed => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!b.has_session_with(a.local_addr()).await);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_contact_discovery() {
        let (a, mut a_events) = spawn_server("alice", ServerConfig::default()).await;
        let (b, mut b_events) = spawn_server("bob", ServerConfig::default()).await;
        let (c, mut c_events) = spawn_server("carol", ServerConfig::default()).await;

        // Bob knows both Alice and Carol.
        establish(&a, &mut a_events, &b, &mut b_events).await;
        establish(&c, &mut c_events, &b, &mut b_events).await;

        // Alice asks Bob where Carol is, by certificate hash.
        let carol_hash = c
            .presentation_store()
            .local_identity()
            .await
            .certificate()
            .hash();
        a.send_contact_request(b.local_addr(), &[carol_hash])
            .await
            .unwrap();

        loop {
            match next_event(&mut a_events).await {
                TestEvent::Contact { answer } => {
                    assert_eq!(answer, c.local_addr());
                    break;
                }
                _ => continue,
            }
        }

        a.close().await;
        b.close().await;
        c.close().await;
    }

    #[tokio::test]
    async fn test_offline_server_refuses_sends() {
        let (a, _a_events) = spawn_server("alice", ServerConfig::default()).await;
        a.close().await;

        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            a.introduce_to(target).await,
            Err(FscpError::ServerOffline)
        ));
        assert!(matches!(
            a.greet(target, Duration::from_millis(100)).await,
            Err(FscpError::ServerOffline)
        ));
    }

    #[test]
    fn test_normalize_v4_mapped() {
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:12000".parse().unwrap();
        let plain: SocketAddr = "192.0.2.1:12000".parse().unwrap();
        assert_eq!(normalize(mapped), plain);

        let v6: SocketAddr = "[2001:db8::1]:12000".parse().unwrap();
        assert_eq!(normalize(v6), v6);
        assert_eq!(normalize(plain), plain);
    }
}
