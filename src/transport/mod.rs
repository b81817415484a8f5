//! Transport layer
//!
//! WebSocket framing over TCP, optionally wrapped in TLS:
//! - `websocket`: dial/accept, message decoding and the shared write pump
//! - `tls`: PEM loading and rustls acceptor/connector construction

mod tls;
mod websocket;

pub use tls::{client_connector, load_certs, load_private_key, server_acceptor};
pub use websocket::{
    accept, connect, decode_message, websocket_config, write_pump, ClientStream, Inbound,
};

use crate::protocol::ProtocolError;
use std::io;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Encoding error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Timeout")]
    Timeout,
}
