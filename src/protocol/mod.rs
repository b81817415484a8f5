//! Protocol definitions and constants

mod envelope;

pub use envelope::{ConnectionState, Envelope};

use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown connection state: {0}")]
    UnknownState(u8),

    #[error("Invalid address assignment: {0}")]
    InvalidAddress(String),
}

/// Lifecycle of one side of a session.
///
/// Both the server's per-connection actor and the client runtime walk
/// `Init -> Connected -> Disconnect`; neither transition is ever reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Socket is up, no address assigned yet
    #[default]
    Init,
    /// Address assigned, payload relay active
    Connected,
    /// Terminal
    Disconnect,
}

/// Whether a read loop keeps going after handling an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Path the WebSocket endpoint is served on
pub const WS_PATH: &str = "/ws";

/// Deadline for a single frame write
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Liveness window: a peer that stays silent this long is dropped
pub const PONG_WAIT: Duration = Duration::from_secs(30);

/// Client ping period (must stay below [`PONG_WAIT`])
pub const PING_PERIOD: Duration = Duration::from_secs(3);

/// Maximum WebSocket message size (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Interval between client dial attempts
pub const DIAL_INTERVAL: Duration = Duration::from_secs(4);

/// Payload sent with the DISCONNECT that rejects a session for lack of addresses
pub const POOL_EXHAUSTED_REASON: &str = "address pool exhausted";
