//! # ws-vpn
//!
//! A lightweight VPN that tunnels raw IPv4 packets between clients and a
//! server over WebSocket connections.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   CONNECT / CONNECTED   ┌──────────────────────────────┐
//! │    Client    │ ◄─────── ws(s) ───────► │  Connection actor (per peer) │
//! │  TUN ◄─► WS  │                         │   read pump │ write pump     │
//! └──────────────┘                         └──────┬──────────────▲────────┘
//!                                                 │ register     │ outbound
//!                                          ┌──────▼──────────────┴────────┐
//!                                          │ Hub: registry addr → actor   │
//!                                          │  TUN → route by dst address  │
//!                                          │  peers → TUN write queue     │
//!                                          └──────────────────────────────┘
//! ```
//!
//! Every client is handed an odd host address of the virtual subnet by the
//! [`pool::AddressPool`]; the even address below it is the server side of
//! that point-to-point segment.

pub mod client;
pub mod config;
pub mod device;
pub mod packet;
pub mod platform;
pub mod pool;
pub mod protocol;
pub mod route;
pub mod server;
pub mod transport;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Address pool error: {0}")]
    Pool(#[from] pool::PoolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TUN device error: {0}")]
    Device(String),

    #[error("Route error: {0}")]
    Route(String),

    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Flatten the outcome of a spawned task, re-raising panics
pub(crate) fn task_result(
    res: std::result::Result<Result<()>, tokio::task::JoinError>,
    task_name: &str,
) -> Result<()> {
    match res {
        Ok(inner) => inner,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(Error::Io(std::io::Error::other(format!(
            "{} task failed: {}",
            task_name, e
        )))),
    }
}
