//! Peer protocol errors

use thiserror::Error;

/// Errors produced by the peer protocol
#[derive(Debug, Error)]
pub enum FscpError {
    /// A datagram could not be decoded
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    CryptographicError(#[from] weave_crypto::CryptoError),

    /// No common cipher suite or elliptic curve with the peer
    #[error("No suitable cipher suite or elliptic curve")]
    NoSuitableCipher,

    /// A session already exists with the peer
    #[error("A session already exists with {0}")]
    SessionAlreadyExist(std::net::SocketAddr),

    /// No session exists with the peer
    #[error("No session for host {0}")]
    NoSessionForHost(std::net::SocketAddr),

    /// The server socket is closed
    #[error("Server is offline")]
    ServerOffline,

    /// A HELLO request went unanswered
    #[error("Hello request timed out")]
    HelloRequestTimedOut,

    /// The peer's host identifier changed mid-lifetime
    #[error("Host identifier mismatch for {0}")]
    HostIdentifierMismatch(std::net::SocketAddr),

    /// A message signature failed to verify
    #[error("Invalid signature from {0}")]
    InvalidSignature(std::net::SocketAddr),

    /// No presentation is stored for the peer
    #[error("No presentation for {0}")]
    NoPresentation(std::net::SocketAddr),

    /// The local sequence number space is exhausted
    #[error("Sequence number space exhausted for {0}")]
    SequenceNumberExhausted(std::net::SocketAddr),

    /// Socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for peer protocol operations
pub type FscpResult<T> = Result<T, FscpError>;
