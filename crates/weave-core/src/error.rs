//! Core errors

use thiserror::Error;

/// Errors produced by the forwarding fabric and the orchestrator
#[derive(Debug, Error)]
pub enum CoreError {
    /// A port index is not registered
    #[error("No such port: {0}")]
    NoSuchPort(String),

    /// A frame was too short or otherwise unparseable
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Installing or querying an OS route failed
    #[error("Route installation failure: {0}")]
    RouteInstallationFailure(String),

    /// The tap device is gone
    #[error("Tap device closed")]
    TapDeviceClosed,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Hostname resolution produced no usable address
    #[error("Unable to resolve {0}")]
    ResolutionFailure(String),

    /// Peer protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] weave_fscp::FscpError),

    /// Cryptographic error
    #[error("Crypto error: {0}")]
    Crypto(#[from] weave_crypto::CryptoError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
