//! FSCP message codec
//!
//! Wire format:
//! [Version: 1 byte][Type: 1 byte][Payload length: 2 bytes BE][Payload]
//!
//! Handshake messages (SESSION_REQUEST, SESSION) carry a trailing signature
//! over every payload byte that precedes it. Data-family messages carry a
//! sequence number and an AEAD ciphertext whose associated data is the
//! message header plus the sequence number.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use weave_crypto::constants::{CERT_HASH_SIZE, HOST_IDENTIFIER_SIZE};
use weave_crypto::{CertificateHash, CipherSuite, EllipticCurve, Identity, Signature, SignatureCertificate};

use crate::constants::{CHANNEL_COUNT, HEADER_SIZE, PROTOCOL_VERSION};
use crate::error::{FscpError, FscpResult};

const TYPE_HELLO_REQUEST: u8 = 0x00;
const TYPE_HELLO_RESPONSE: u8 = 0x01;
const TYPE_PRESENTATION: u8 = 0x02;
const TYPE_SESSION_REQUEST: u8 = 0x03;
const TYPE_SESSION: u8 = 0x04;
const TYPE_DATA_BASE: u8 = 0x70;
const TYPE_CONTACT_REQUEST: u8 = 0xFD;
const TYPE_CONTACT: u8 = 0xFE;
const TYPE_KEEP_ALIVE: u8 = 0xFF;

/// The 32 random bytes a node picks per peer slot to detect restarts
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HostIdentifier {
    bytes: [u8; HOST_IDENTIFIER_SIZE],
}

impl HostIdentifier {
    /// Pick a fresh random identifier
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; HOST_IDENTIFIER_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; HOST_IDENTIFIER_SIZE]) -> Self {
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; HOST_IDENTIFIER_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for HostIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HostIdentifier({:02x}{:02x}{:02x}{:02x}..)",
            self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]
        )
    }
}

/// What a data-family message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Application payload on one of the 16 channels
    Channel(u8),
    /// An encrypted contact request (list of certificate hashes)
    ContactRequest,
    /// An encrypted contact answer (hash to endpoint map)
    Contact,
    /// Liveness probe; plaintext is discarded
    KeepAlive,
}

impl DataKind {
    fn wire_type(&self) -> u8 {
        match self {
            Self::Channel(n) => TYPE_DATA_BASE + n,
            Self::ContactRequest => TYPE_CONTACT_REQUEST,
            Self::Contact => TYPE_CONTACT,
            Self::KeepAlive => TYPE_KEEP_ALIVE,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            TYPE_CONTACT_REQUEST => Some(Self::ContactRequest),
            TYPE_CONTACT => Some(Self::Contact),
            TYPE_KEEP_ALIVE => Some(Self::KeepAlive),
            v if (TYPE_DATA_BASE..TYPE_DATA_BASE + CHANNEL_COUNT).contains(&v) => {
                Some(Self::Channel(v - TYPE_DATA_BASE))
            }
            _ => None,
        }
    }
}

/// A data-family message: sequence number plus AEAD ciphertext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub kind: DataKind,
    pub sequence_number: u32,
    pub ciphertext: Bytes,
}

impl DataMessage {
    /// Associated data for the AEAD: the message header and the sequence
    /// number, exactly as they appear on the wire.
    pub fn associated_data(kind: DataKind, sequence_number: u32, ciphertext_len: usize) -> [u8; 8] {
        let payload_len = (4 + 2 + ciphertext_len) as u16;
        let mut aad = [0u8; 8];
        aad[0] = PROTOCOL_VERSION;
        aad[1] = kind.wire_type();
        aad[2..4].copy_from_slice(&payload_len.to_be_bytes());
        aad[4..8].copy_from_slice(&sequence_number.to_be_bytes());
        aad
    }
}

/// A SESSION_REQUEST: capability lists signed by the sender
#[derive(Debug, Clone)]
pub struct SessionRequestMessage {
    pub session_number: u32,
    pub host_identifier: HostIdentifier,
    pub cipher_suites: Vec<CipherSuite>,
    pub elliptic_curves: Vec<EllipticCurve>,
    pub signature: Signature,
}

impl SessionRequestMessage {
    /// Build and sign a new request
    pub fn new_signed(
        session_number: u32,
        host_identifier: HostIdentifier,
        cipher_suites: Vec<CipherSuite>,
        elliptic_curves: Vec<EllipticCurve>,
        identity: &Identity,
    ) -> Self {
        let mut message = Self {
            session_number,
            host_identifier,
            cipher_suites,
            elliptic_curves,
            signature: Signature::from_bytes([0u8; 64]),
        };
        message.signature = identity.sign(&message.signed_payload());
        message
    }

    fn signed_payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(self.session_number);
        buf.put_slice(self.host_identifier.as_bytes());
        buf.put_u16(self.cipher_suites.len() as u16);
        for cs in &self.cipher_suites {
            buf.put_u8(*cs as u8);
        }
        buf.put_u16(self.elliptic_curves.len() as u16);
        for ec in &self.elliptic_curves {
            buf.put_u8(*ec as u8);
        }
        buf.to_vec()
    }

    /// Check the trailing signature against the sender's certificate
    pub fn verify_signature(&self, certificate: &SignatureCertificate) -> FscpResult<()> {
        certificate
            .verify(&self.signed_payload(), &self.signature)
            .map_err(|_| FscpError::MalformedMessage("session request signature".into()))
    }
}

/// A SESSION: chosen parameters and the sender's ephemeral public key
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub session_number: u32,
    pub host_identifier: HostIdentifier,
    pub cipher_suite: CipherSuite,
    pub elliptic_curve: EllipticCurve,
    pub public_key: Bytes,
    pub signature: Signature,
}

impl SessionMessage {
    /// Build and sign a new session message
    pub fn new_signed(
        session_number: u32,
        host_identifier: HostIdentifier,
        cipher_suite: CipherSuite,
        elliptic_curve: EllipticCurve,
        public_key: Bytes,
        identity: &Identity,
    ) -> Self {
        let mut message = Self {
            session_number,
            host_identifier,
            cipher_suite,
            elliptic_curve,
            public_key,
            signature: Signature::from_bytes([0u8; 64]),
        };
        message.signature = identity.sign(&message.signed_payload());
        message
    }

    fn signed_payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(self.session_number);
        buf.put_slice(self.host_identifier.as_bytes());
        buf.put_u8(self.cipher_suite as u8);
        buf.put_u8(self.elliptic_curve as u8);
        buf.put_u16(self.public_key.len() as u16);
        buf.put_slice(&self.public_key);
        buf.to_vec()
    }

    /// Check the trailing signature against the sender's certificate
    pub fn verify_signature(&self, certificate: &SignatureCertificate) -> FscpResult<()> {
        certificate
            .verify(&self.signed_payload(), &self.signature)
            .map_err(|_| FscpError::MalformedMessage("session signature".into()))
    }
}

/// A decoded FSCP message
#[derive(Debug, Clone)]
pub enum Message {
    HelloRequest { unique_number: u32 },
    HelloResponse { unique_number: u32 },
    Presentation { certificate: Bytes },
    SessionRequest(SessionRequestMessage),
    Session(SessionMessage),
    Data(DataMessage),
}

impl Message {
    fn wire_type(&self) -> u8 {
        match self {
            Self::HelloRequest { .. } => TYPE_HELLO_REQUEST,
            Self::HelloResponse { .. } => TYPE_HELLO_RESPONSE,
            Self::Presentation { .. } => TYPE_PRESENTATION,
            Self::SessionRequest(_) => TYPE_SESSION_REQUEST,
            Self::Session(_) => TYPE_SESSION,
            Self::Data(data) => data.kind.wire_type(),
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::HelloRequest { unique_number } | Self::HelloResponse { unique_number } => {
                unique_number.to_be_bytes().to_vec()
            }
            Self::Presentation { certificate } => certificate.to_vec(),
            Self::SessionRequest(request) => {
                let mut payload = request.signed_payload();
                payload.extend_from_slice(&(64u16).to_be_bytes());
                payload.extend_from_slice(request.signature.as_bytes());
                payload
            }
            Self::Session(session) => {
                let mut payload = session.signed_payload();
                payload.extend_from_slice(&(64u16).to_be_bytes());
                payload.extend_from_slice(session.signature.as_bytes());
                payload
            }
            Self::Data(data) => {
                let mut buf = BytesMut::with_capacity(6 + data.ciphertext.len());
                buf.put_u32(data.sequence_number);
                buf.put_u16(data.ciphertext.len() as u16);
                buf.put_slice(&data.ciphertext);
                buf.to_vec()
            }
        }
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Bytes {
        let payload = self.payload();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.wire_type());
        buf.put_u16(payload.len() as u16);
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Deserialize from wire bytes
    pub fn from_bytes(mut bytes: Bytes) -> FscpResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(FscpError::MalformedMessage(format!(
                "datagram too short: {} bytes",
                bytes.len()
            )));
        }

        let version = bytes.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(FscpError::MalformedMessage(format!(
                "unsupported protocol version {}",
                version
            )));
        }

        let message_type = bytes.get_u8();
        let length = bytes.get_u16() as usize;
        if bytes.remaining() != length {
            return Err(FscpError::MalformedMessage(format!(
                "payload length mismatch: header says {}, got {}",
                length,
                bytes.remaining()
            )));
        }

        match message_type {
            TYPE_HELLO_REQUEST | TYPE_HELLO_RESPONSE => {
                if length != 4 {
                    return Err(FscpError::MalformedMessage("hello payload size".into()));
                }
                let unique_number = bytes.get_u32();
                Ok(if message_type == TYPE_HELLO_REQUEST {
                    Self::HelloRequest { unique_number }
                } else {
                    Self::HelloResponse { unique_number }
                })
            }
            TYPE_PRESENTATION => Ok(Self::Presentation { certificate: bytes }),
            TYPE_SESSION_REQUEST => Ok(Self::SessionRequest(parse_session_request(bytes)?)),
            TYPE_SESSION => Ok(Self::Session(parse_session(bytes)?)),
            other => match DataKind::from_wire(other) {
                Some(kind) => {
                    if bytes.remaining() < 6 {
                        return Err(FscpError::MalformedMessage("data payload size".into()));
                    }
                    let sequence_number = bytes.get_u32();
                    let ciphertext_len = bytes.get_u16() as usize;
                    if bytes.remaining() != ciphertext_len {
                        return Err(FscpError::MalformedMessage(
                            "ciphertext length mismatch".into(),
                        ));
                    }
                    Ok(Self::Data(DataMessage {
                        kind,
                        sequence_number,
                        ciphertext: bytes,
                    }))
                }
                None => Err(FscpError::MalformedMessage(format!(
                    "unknown message type 0x{:02x}",
                    other
                ))),
            },
        }
    }
}

fn take_host_identifier(bytes: &mut Bytes) -> FscpResult<HostIdentifier> {
    if bytes.remaining() < HOST_IDENTIFIER_SIZE {
        return Err(FscpError::MalformedMessage("host identifier size".into()));
    }
    let mut id = [0u8; HOST_IDENTIFIER_SIZE];
    bytes.copy_to_slice(&mut id);
    Ok(HostIdentifier::from_bytes(id))
}

fn take_signature(bytes: &mut Bytes) -> FscpResult<Signature> {
    if bytes.remaining() < 2 {
        return Err(FscpError::MalformedMessage("signature length".into()));
    }
    let sig_len = bytes.get_u16() as usize;
    if bytes.remaining() != sig_len {
        return Err(FscpError::MalformedMessage("signature size".into()));
    }
    let mut sig = vec![0u8; sig_len];
    bytes.copy_to_slice(&mut sig);
    Signature::try_from_slice(&sig)
        .map_err(|_| FscpError::MalformedMessage("signature size".into()))
}

fn parse_session_request(mut bytes: Bytes) -> FscpResult<SessionRequestMessage> {
    if bytes.remaining() < 4 {
        return Err(FscpError::MalformedMessage("session request size".into()));
    }
    let session_number = bytes.get_u32();
    let host_identifier = take_host_identifier(&mut bytes)?;

    if bytes.remaining() < 2 {
        return Err(FscpError::MalformedMessage("cipher suite list".into()));
    }
    let cs_count = bytes.get_u16() as usize;
    if bytes.remaining() < cs_count {
        return Err(FscpError::MalformedMessage("cipher suite list size".into()));
    }
    let mut cipher_suites = Vec::with_capacity(cs_count);
    for _ in 0..cs_count {
        cipher_suites.push(
            CipherSuite::try_from(bytes.get_u8())
                .map_err(|_| FscpError::MalformedMessage("unknown cipher suite".into()))?,
        );
    }

    if bytes.remaining() < 2 {
        return Err(FscpError::MalformedMessage("elliptic curve list".into()));
    }
    let ec_count = bytes.get_u16() as usize;
    if bytes.remaining() < ec_count {
        return Err(FscpError::MalformedMessage("elliptic curve list size".into()));
    }
    let mut elliptic_curves = Vec::with_capacity(ec_count);
    for _ in 0..ec_count {
        elliptic_curves.push(
            EllipticCurve::try_from(bytes.get_u8())
                .map_err(|_| FscpError::MalformedMessage("unknown elliptic curve".into()))?,
        );
    }

    let signature = take_signature(&mut bytes)?;

    Ok(SessionRequestMessage {
        session_number,
        host_identifier,
        cipher_suites,
        elliptic_curves,
        signature,
    })
}

fn parse_session(mut bytes: Bytes) -> FscpResult<SessionMessage> {
    if bytes.remaining() < 4 {
        return Err(FscpError::MalformedMessage("session size".into()));
    }
    let session_number = bytes.get_u32();
    let host_identifier = take_host_identifier(&mut bytes)?;

    if bytes.remaining() < 4 {
        return Err(FscpError::MalformedMessage("session parameters".into()));
    }
    let cipher_suite = CipherSuite::try_from(bytes.get_u8())
        .map_err(|_| FscpError::MalformedMessage("unknown cipher suite".into()))?;
    let elliptic_curve = EllipticCurve::try_from(bytes.get_u8())
        .map_err(|_| FscpError::MalformedMessage("unknown elliptic curve".into()))?;

    let pk_len = bytes.get_u16() as usize;
    if bytes.remaining() < pk_len {
        return Err(FscpError::MalformedMessage("public key size".into()));
    }
    let public_key = bytes.split_to(pk_len);

    let signature = take_signature(&mut bytes)?;

    Ok(SessionMessage {
        session_number,
        host_identifier,
        cipher_suite,
        elliptic_curve,
        public_key,
        signature,
    })
}

/// Encode a CONTACT_REQUEST plaintext: a list of certificate hashes
pub fn write_hash_list(hashes: &[CertificateHash]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(2 + hashes.len() * CERT_HASH_SIZE);
    buf.put_u16(hashes.len() as u16);
    for hash in hashes {
        buf.put_slice(hash.as_bytes());
    }
    buf.to_vec()
}

/// Decode a CONTACT_REQUEST plaintext
pub fn parse_hash_list(mut data: &[u8]) -> FscpResult<Vec<CertificateHash>> {
    if data.len() < 2 {
        return Err(FscpError::MalformedMessage("hash list size".into()));
    }
    let count = data.get_u16() as usize;
    if data.len() != count * CERT_HASH_SIZE {
        return Err(FscpError::MalformedMessage("hash list size".into()));
    }
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        let mut hash = [0u8; CERT_HASH_SIZE];
        data.copy_to_slice(&mut hash);
        hashes.push(CertificateHash::from_bytes(hash));
    }
    Ok(hashes)
}

/// Encode a CONTACT plaintext: hash to endpoint entries
pub fn write_contact_map(contacts: &[(CertificateHash, SocketAddr)]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16(contacts.len() as u16);
    for (hash, endpoint) in contacts {
        buf.put_slice(hash.as_bytes());
        match endpoint.ip() {
            IpAddr::V4(addr) => {
                buf.put_u8(4);
                buf.put_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                buf.put_u8(6);
                buf.put_slice(&addr.octets());
            }
        }
        buf.put_u16(endpoint.port());
    }
    buf.to_vec()
}

/// Decode a CONTACT plaintext
pub fn parse_contact_map(mut data: &[u8]) -> FscpResult<Vec<(CertificateHash, SocketAddr)>> {
    if data.len() < 2 {
        return Err(FscpError::MalformedMessage("contact map size".into()));
    }
    let count = data.get_u16() as usize;
    let mut contacts = Vec::with_capacity(count);
    for _ in 0..count {
        if data.len() < CERT_HASH_SIZE + 1 {
            return Err(FscpError::MalformedMessage("contact entry size".into()));
        }
        let mut hash = [0u8; CERT_HASH_SIZE];
        data.copy_to_slice(&mut hash);
        let family = data.get_u8();
        let ip: IpAddr = match family {
            4 => {
                if data.len() < 4 + 2 {
                    return Err(FscpError::MalformedMessage("contact entry size".into()));
                }
                let mut octets = [0u8; 4];
                data.copy_to_slice(&mut octets);
                Ipv4Addr::from(octets).into()
            }
            6 => {
                if data.len() < 16 + 2 {
                    return Err(FscpError::MalformedMessage("contact entry size".into()));
                }
                let mut octets = [0u8; 16];
                data.copy_to_slice(&mut octets);
                Ipv6Addr::from(octets).into()
            }
            _ => {
                return Err(FscpError::MalformedMessage(format!(
                    "unknown address family {}",
                    family
                )))
            }
        };
        let port = data.get_u16();
        contacts.push((CertificateHash::from_bytes(hash), SocketAddr::new(ip, port)));
    }
    if !data.is_empty() {
        return Err(FscpError::MalformedMessage("trailing contact bytes".into()));
    }
    Ok(contacts)
}
