//! Per-peer session state
//!
//! One `PeerSession` exists per remote endpoint. It owns the host
//! identifiers, the optional current and next (prepared) sessions, and the
//! sequence numbers enforcing per-peer ordering and anti-replay. All
//! mutation happens under the server's session lock.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use weave_crypto::constants::AEAD_TAG_SIZE;
use weave_crypto::kdf::derive_session_material;
use weave_crypto::{aead, CipherSuite, EllipticCurve, EphemeralKeyPair, SessionKeyMaterial};

use crate::error::{FscpError, FscpResult};
use crate::message::{DataKind, DataMessage, HostIdentifier};

/// Why a session went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLossReason {
    /// No inbound activity for the configured timeout
    Timeout,
    /// Closed locally
    ManualTermination,
}

impl std::fmt::Display for SessionLossReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::ManualTermination => write!(f, "manual termination"),
        }
    }
}

/// Result of attempting to open an inbound data frame
pub enum OpenOutcome {
    /// Authenticated plaintext
    Plaintext(Vec<u8>),
    /// No current session; dropped silently
    NoSession,
    /// Sequence number not strictly greater than the last accepted one
    Replayed,
    /// AEAD authentication failed (stale key after a rekey, or tampering)
    Failed,
}

/// Parameters and keypair prepared for a session not yet completed
pub struct PreparedSession {
    pub session_number: u32,
    pub cipher_suite: CipherSuite,
    pub elliptic_curve: EllipticCurve,
    keypair: EphemeralKeyPair,
}

impl PreparedSession {
    /// The ephemeral public key to advertise in a SESSION message
    pub fn public_key(&self) -> &[u8] {
        self.keypair.public_key()
    }
}

/// An established session with derived keys
pub struct ActiveSession {
    pub session_number: u32,
    pub cipher_suite: CipherSuite,
    pub elliptic_curve: EllipticCurve,
    local_public_key: Bytes,
    keys: SessionKeyMaterial,
    started_at: Instant,
    local_sequence_number: u32,
    remote_sequence_number: u32,
}

impl ActiveSession {
    /// The ephemeral public key this side advertised for the session
    pub fn local_public_key(&self) -> &Bytes {
        &self.local_public_key
    }

    /// Highest inbound sequence number accepted so far
    pub fn remote_sequence_number(&self) -> u32 {
        self.remote_sequence_number
    }

    /// Whether the session should be rekeyed
    pub fn is_old(&self, session_age: Duration, sequence_threshold: u32) -> bool {
        self.started_at.elapsed() >= session_age
            || self.local_sequence_number >= sequence_threshold
            || self.remote_sequence_number >= sequence_threshold
    }
}

/// The full per-peer protocol state
pub struct PeerSession {
    local_host_identifier: HostIdentifier,
    first_remote_host_identifier: Option<HostIdentifier>,
    current: Option<ActiveSession>,
    next: Option<PreparedSession>,
    last_activity: Instant,
    last_session_request: Option<Instant>,
}

impl PeerSession {
    /// Create a fresh peer slot with a random local host identifier
    pub fn new() -> Self {
        Self {
            local_host_identifier: HostIdentifier::random(),
            first_remote_host_identifier: None,
            current: None,
            next: None,
            last_activity: Instant::now(),
            last_session_request: None,
        }
    }

    /// The identifier this side presents to the peer
    pub fn local_host_identifier(&self) -> HostIdentifier {
        self.local_host_identifier
    }

    /// Record the peer's host identifier the first time it is seen.
    ///
    /// Returns false when a different identifier was already recorded; the
    /// caller must then reject the message.
    pub fn set_first_remote_host_identifier(&mut self, identifier: HostIdentifier) -> bool {
        match self.first_remote_host_identifier {
            None => {
                self.first_remote_host_identifier = Some(identifier);
                true
            }
            Some(first) => first == identifier,
        }
    }

    /// The session number a new SESSION_REQUEST should propose
    pub fn next_session_number(&self) -> u32 {
        let base = self
            .current
            .as_ref()
            .map(|session| session.session_number + 1)
            .unwrap_or(1);
        match &self.next {
            Some(prepared) => prepared.session_number.max(base),
            None => base,
        }
    }

    /// Whether a current session is installed
    pub fn has_current_session(&self) -> bool {
        self.current.is_some()
    }

    /// The current session, if any
    pub fn current_session(&self) -> Option<&ActiveSession> {
        self.current.as_ref()
    }

    /// The prepared next session, if any
    pub fn next_session(&self) -> Option<&PreparedSession> {
        self.next.as_ref()
    }

    /// Prepare a session: generate an ephemeral keypair for the parameters.
    ///
    /// Preparing the same (number, suite, curve) again keeps the existing
    /// keypair, so retransmitted handshake messages cannot desynchronize
    /// the two sides.
    pub fn prepare_session(
        &mut self,
        session_number: u32,
        cipher_suite: CipherSuite,
        elliptic_curve: EllipticCurve,
    ) -> FscpResult<()> {
        if let Some(prepared) = &self.next {
            if prepared.session_number == session_number
                && prepared.cipher_suite == cipher_suite
                && prepared.elliptic_curve == elliptic_curve
            {
                return Ok(());
            }
        }

        let keypair = EphemeralKeyPair::generate(elliptic_curve)?;
        self.next = Some(PreparedSession {
            session_number,
            cipher_suite,
            elliptic_curve,
            keypair,
        });
        Ok(())
    }

    /// Complete the prepared session against the peer's public key.
    ///
    /// Returns `Ok(false)` when nothing was prepared; the caller prepares
    /// with the message's parameters and retries.
    pub fn complete_session(
        &mut self,
        remote_public_key: &[u8],
        remote_host_identifier: HostIdentifier,
    ) -> FscpResult<bool> {
        let prepared = match self.next.take() {
            Some(prepared) => prepared,
            None => return Ok(false),
        };

        let derived = prepared
            .keypair
            .diffie_hellman(remote_public_key)
            .and_then(|shared| {
                derive_session_material(
                    prepared.cipher_suite,
                    &shared,
                    prepared.keypair.public_key(),
                    remote_public_key,
                    self.local_host_identifier.as_bytes(),
                    remote_host_identifier.as_bytes(),
                )
            });
        let keys = match derived {
            Ok(keys) => keys,
            Err(error) => {
                // Keep the prepared keypair so a valid retransmit can still
                // complete the session.
                self.next = Some(prepared);
                return Err(error.into());
            }
        };
        self.current = Some(ActiveSession {
            session_number: prepared.session_number,
            cipher_suite: prepared.cipher_suite,
            elliptic_curve: prepared.elliptic_curve,
            local_public_key: Bytes::copy_from_slice(prepared.keypair.public_key()),
            keys,
            started_at: Instant::now(),
            local_sequence_number: 0,
            remote_sequence_number: 0,
        });
        self.last_activity = Instant::now();
        Ok(true)
    }

    /// Drop the current and prepared sessions.
    ///
    /// Returns whether a current session existed. The host identifiers are
    /// kept: the peer slot still refers to the same remote process.
    pub fn clear(&mut self) -> bool {
        let had_session = self.current.is_some();
        self.current = None;
        self.next = None;
        had_session
    }

    /// Whether the peer has been silent for too long
    pub fn has_timed_out(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Gate SESSION_REQUEST sends so a disagreeing pair of peers cannot
    /// ping-pong re-requests. Returns whether a request may be sent now and
    /// stamps the attempt when allowed.
    pub fn may_request_session(&mut self, min_interval: Duration) -> bool {
        match self.last_session_request {
            Some(last) if last.elapsed() < min_interval => false,
            _ => {
                self.last_session_request = Some(Instant::now());
                true
            }
        }
    }

    /// Seal an outbound frame under the current session.
    ///
    /// The sequence number is incremented first, so consecutive frames to
    /// one peer leave with strictly increasing numbers. The number space is
    /// never wrapped: exhaustion is an error and the caller closes the
    /// session.
    pub fn seal_data(
        &mut self,
        endpoint: SocketAddr,
        kind: DataKind,
        plaintext: &[u8],
    ) -> FscpResult<DataMessage> {
        let session = self
            .current
            .as_mut()
            .ok_or(FscpError::NoSessionForHost(endpoint))?;

        if session.local_sequence_number == u32::MAX {
            return Err(FscpError::SequenceNumberExhausted(endpoint));
        }
        let sequence_number = session.local_sequence_number + 1;

        let aad =
            DataMessage::associated_data(kind, sequence_number, plaintext.len() + AEAD_TAG_SIZE);
        let ciphertext = aead::seal(
            session.cipher_suite,
            &session.keys.local_key,
            &session.keys.local_nonce_prefix,
            sequence_number,
            plaintext,
            &aad,
        )?;

        session.local_sequence_number = sequence_number;
        Ok(DataMessage {
            kind,
            sequence_number,
            ciphertext: Bytes::from(ciphertext),
        })
    }

    /// Open an inbound frame under the current session.
    ///
    /// A frame is accepted only when its sequence number is strictly
    /// greater than the last accepted one; acceptance advances the counter
    /// and refreshes the activity clock.
    pub fn open_data(&mut self, message: &DataMessage) -> OpenOutcome {
        let session = match self.current.as_mut() {
            Some(session) => session,
            None => return OpenOutcome::NoSession,
        };

        if message.sequence_number <= session.remote_sequence_number {
            return OpenOutcome::Replayed;
        }

        let aad = DataMessage::associated_data(
            message.kind,
            message.sequence_number,
            message.ciphertext.len(),
        );
        match aead::open(
            session.cipher_suite,
            &session.keys.remote_key,
            &session.keys.remote_nonce_prefix,
            message.sequence_number,
            &message.ciphertext,
            &aad,
        ) {
            Ok(plaintext) => {
                session.remote_sequence_number = message.sequence_number;
                self.last_activity = Instant::now();
                OpenOutcome::Plaintext(plaintext)
            }
            Err(_) => OpenOutcome::Failed,
        }
    }
}

impl Default for PeerSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> SocketAddr {
        "192.0.2.1:12000".parse().unwrap()
    }

    /// Drive both sides of a handshake directly against the state machine.
    fn establish_pair() -> (PeerSession, PeerSession) {
        let mut alice = PeerSession::new();
        let mut bob = PeerSession::new();

        let suite = CipherSuite::EcdheRsaAes128GcmSha256;
        let curve = EllipticCurve::Secp384r1;

        bob.prepare_session(1, suite, curve).unwrap();
        alice.prepare_session(1, suite, curve).unwrap();

        let alice_id = alice.local_host_identifier();
        let bob_id = bob.local_host_identifier();
        assert!(alice.set_first_remote_host_identifier(bob_id));
        assert!(bob.set_first_remote_host_identifier(alice_id));

        let bob_public = bob.next_session().unwrap().public_key().to_vec();
        let alice_public = alice.next_session().unwrap().public_key().to_vec();

        assert!(alice.complete_session(&bob_public, bob_id).unwrap());
        assert!(bob.complete_session(&alice_public, alice_id).unwrap());

        (alice, bob)
    }

    #[test]
    fn test_handshake_produces_matching_keys() {
        let (mut alice, mut bob) = establish_pair();

        let frame = alice
            .seal_data(endpoint(), DataKind::Channel(0), b"hello")
            .unwrap();
        assert_eq!(frame.sequence_number, 1);

        match bob.open_data(&frame) {
            OpenOutcome::Plaintext(plaintext) => assert_eq!(plaintext, b"hello"),
            _ => panic!("frame should decrypt"),
        }
    }

    #[test]
    fn test_sequence_numbers_strictly_increase() {
        let (mut alice, _) = establish_pair();

        for expected in 1..=5u32 {
            let frame = alice
                .seal_data(endpoint(), DataKind::Channel(0), b"x")
                .unwrap();
            assert_eq!(frame.sequence_number, expected);
        }
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = establish_pair();

        let frame = alice
            .seal_data(endpoint(), DataKind::Channel(0), b"once")
            .unwrap();
        assert!(matches!(bob.open_data(&frame), OpenOutcome::Plaintext(_)));
        assert!(matches!(bob.open_data(&frame), OpenOutcome::Replayed));
    }

    #[test]
    fn test_out_of_order_frames_dropped() {
        let (mut alice, mut bob) = establish_pair();

        let first = alice
            .seal_data(endpoint(), DataKind::Channel(0), b"1")
            .unwrap();
        let second = alice
            .seal_data(endpoint(), DataKind::Channel(0), b"2")
            .unwrap();

        assert!(matches!(bob.open_data(&second), OpenOutcome::Plaintext(_)));
        // The earlier frame now fails the strictly-greater check.
        assert!(matches!(bob.open_data(&first), OpenOutcome::Replayed));
    }

    #[test]
    fn test_data_before_session_dropped() {
        let (mut alice, _) = establish_pair();
        let mut stranger = PeerSession::new();

        let frame = alice
            .seal_data(endpoint(), DataKind::Channel(0), b"early")
            .unwrap();
        assert!(matches!(stranger.open_data(&frame), OpenOutcome::NoSession));
    }

    #[test]
    fn test_host_identifier_immutable() {
        let mut session = PeerSession::new();
        let first = HostIdentifier::random();
        let other = HostIdentifier::random();

        assert!(session.set_first_remote_host_identifier(first));
        assert!(session.set_first_remote_host_identifier(first));
        assert!(!session.set_first_remote_host_identifier(other));
        // The recorded identifier survives a session clear.
        session.clear();
        assert!(session.set_first_remote_host_identifier(first));
        assert!(!session.set_first_remote_host_identifier(other));
    }

    #[test]
    fn test_sequence_exhaustion_refuses_to_wrap() {
        let (mut alice, _) = establish_pair();

        alice.current.as_mut().unwrap().local_sequence_number = u32::MAX;
        assert!(matches!(
            alice.seal_data(endpoint(), DataKind::Channel(0), b"x"),
            Err(FscpError::SequenceNumberExhausted(_))
        ));
    }

    #[test]
    fn test_session_is_old_by_sequence_threshold() {
        let (mut alice, _) = establish_pair();

        let session = alice.current.as_mut().unwrap();
        assert!(!session.is_old(Duration::from_secs(3600), 100));
        session.local_sequence_number = 100;
        assert!(session.is_old(Duration::from_secs(3600), 100));
    }

    #[test]
    fn test_session_is_old_by_age() {
        let (alice, _) = establish_pair();

        let session = alice.current_session().unwrap();
        assert!(session.is_old(Duration::from_secs(0), u32::MAX));
        assert!(!session.is_old(Duration::from_secs(3600), u32::MAX));
    }

    #[test]
    fn test_prepare_is_idempotent_for_same_parameters() {
        let mut session = PeerSession::new();
        let suite = CipherSuite::EcdheRsaAes128GcmSha256;
        let curve = EllipticCurve::Secp384r1;

        session.prepare_session(1, suite, curve).unwrap();
        let public = session.next_session().unwrap().public_key().to_vec();

        session.prepare_session(1, suite, curve).unwrap();
        assert_eq!(session.next_session().unwrap().public_key(), &public[..]);

        // A different number replaces the prepared keypair.
        session.prepare_session(2, suite, curve).unwrap();
        assert_ne!(session.next_session().unwrap().public_key(), &public[..]);
    }

    #[test]
    fn test_complete_without_prepare_reports_false() {
        let mut session = PeerSession::new();
        let other = EphemeralKeyPair::generate(EllipticCurve::Secp384r1).unwrap();

        let completed = session
            .complete_session(other.public_key(), HostIdentifier::random())
            .unwrap();
        assert!(!completed);
        assert!(!session.has_current_session());
    }

    #[test]
    fn test_session_request_rate_cap() {
        let mut session = PeerSession::new();
        let interval = Duration::from_secs(60);

        assert!(session.may_request_session(interval));
        assert!(!session.may_request_session(interval));
        assert!(session.may_request_session(Duration::from_secs(0)));
    }

    #[test]
    fn test_clear_reports_session_presence() {
        let (mut alice, _) = establish_pair();

        assert!(alice.clear());
        assert!(!alice.clear());
        assert!(!alice.has_current_session());
    }
}
