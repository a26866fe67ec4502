//! FSCP — the weave peer protocol
//!
//! A UDP protocol that establishes authenticated, forward-secret sessions
//! between peers and carries encrypted frames over 16 data channels:
//! - HELLO liveness probes with round-trip timing
//! - PRESENTATION certificate exchange
//! - SESSION_REQUEST / SESSION handshake with cipher negotiation and
//!   ephemeral ECDH, rekeyed as sessions age
//! - DATA frames with per-peer sequence numbers and anti-replay
//! - CONTACT discovery of peers known only by certificate hash

pub mod constants;
pub mod error;
pub mod greeter;
pub mod message;
pub mod presentation;
pub mod server;
pub mod session;

pub use error::{FscpError, FscpResult};
pub use message::{DataKind, HostIdentifier, Message};
pub use presentation::{PresentationStatus, PresentationStore};
pub use server::{normalize, Server, ServerConfig, ServerHandler};
pub use session::{OpenOutcome, PeerSession, SessionLossReason};
