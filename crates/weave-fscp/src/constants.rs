//! Protocol constants

use std::time::Duration;

/// Wire protocol version carried in every message header
pub const PROTOCOL_VERSION: u8 = 3;

/// Message header size: version, type, payload length
pub const HEADER_SIZE: usize = 4;

/// Default UDP port
pub const DEFAULT_PORT: u16 = 12000;

/// Largest datagram the server will read or write
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Number of data channels (DATA_0 through DATA_15)
pub const CHANNEL_COUNT: u8 = 16;

/// Channel carrying Ethernet or IP frames
pub const CHANNEL_FRAMES: u8 = 0;

/// Channel carrying control messages (routes exchange)
pub const CHANNEL_MESSAGES: u8 = 1;

/// Random padding carried in KEEP_ALIVE plaintext
pub const KEEP_ALIVE_DATA_SIZE: usize = 32;

/// Default interval between keep-alive ticks
pub const SESSION_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(10);

/// Default inbound-silence duration after which a session is dropped
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default age after which an established session is rekeyed
pub const SESSION_AGE: Duration = Duration::from_secs(3600);

/// Default sequence number past which a session is considered old
pub const SEQUENCE_THRESHOLD: u32 = 1 << 31;

/// Default minimum spacing between SESSION_REQUEST sends to one peer
pub const SESSION_REQUEST_MIN_INTERVAL: Duration = Duration::from_secs(3);

/// Default HELLO round-trip deadline
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(3);
