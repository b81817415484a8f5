//! VPN server
//!
//! Accepts WebSocket clients, hands each an address from the pool and
//! relays packets between them and the server's tunnel interface.

mod connection;
mod hub;

pub use connection::{serve, Connection};
pub use hub::{ClientHandle, Hub, HubHandle, DEFAULT_IFACE_QUEUE};

use crate::config::ServerConfig;
use crate::device::{TunConfig, TunDevice};
use crate::pool::AddressPool;
use crate::protocol::WRITE_WAIT;
use crate::transport::{self, TransportError};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// VPN server
pub struct VpnServer {
    config: ServerConfig,
    pool: Arc<AddressPool>,
}

impl VpnServer {
    /// Create a server; builds the address pool from `vpn_addr`
    pub fn new(config: ServerConfig) -> crate::Result<Self> {
        let pool = Arc::new(AddressPool::with_server(config.vpn_addr)?);
        info!(
            "Address pool {} ({} client addresses)",
            pool.subnet(),
            pool.capacity()
        );
        Ok(Self { config, pool })
    }

    /// Interface settings for the server side of the virtual subnet
    pub fn tun_config(&self) -> TunConfig {
        TunConfig::new(self.config.vpn_addr)
            .with_name(self.config.tun_name.clone())
            .with_mtu(self.config.mtu)
    }

    /// Shared address pool
    pub fn pool(&self) -> Arc<AddressPool> {
        Arc::clone(&self.pool)
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> crate::Result<TcpListener> {
        let listen = self.config.listen();
        TcpListener::bind(&listen)
            .await
            .map_err(|e| crate::Error::Config(format!("Failed to bind {}: {}", listen, e)))
    }

    /// Serve clients until `shutdown` resolves or the tunnel bridge fails
    pub async fn run<F>(
        self,
        listener: TcpListener,
        device: TunDevice,
        shutdown: F,
    ) -> crate::Result<()>
    where
        F: Future<Output = ()>,
    {
        let acceptor = match self.config.tls() {
            Some((cert, key)) => {
                info!("TLS enabled with cert: {}", cert.display());
                Some(transport::server_acceptor(cert, key)?)
            }
            None => {
                info!("TLS disabled (no tls_cert/tls_key configured)");
                None
            }
        };

        let (hub, mut bridge) = Hub::spawn(Arc::clone(&self.pool), device, DEFAULT_IFACE_QUEUE);
        let mut connections = JoinSet::new();
        let queue_len = self.config.outbound_queue;
        let read_timeout = self.config.read_timeout();

        info!(
            "Listening on {} (path {})",
            listener.local_addr()?,
            crate::protocol::WS_PATH
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down...");
                    bridge.abort();
                    return Ok(());
                }
                res = &mut bridge => {
                    let result = crate::task_result(res, "tunnel bridge");
                    error!("Tunnel bridge stopped: {:?}", result);
                    return match result {
                        Ok(()) => Err(crate::Error::Device("tunnel bridge stopped".into())),
                        Err(e) => Err(e),
                    };
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("New connection from {}", peer_addr);
                            let acceptor = acceptor.clone();
                            let hub = hub.clone();
                            connections.spawn(async move {
                                match handle_stream(stream, peer_addr, acceptor, hub, queue_len, read_timeout).await {
                                    Ok(()) => info!("Connection from {} closed", peer_addr),
                                    Err(e) => warn!("Connection from {} ended: {}", peer_addr, e),
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }
}

async fn handle_stream(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    hub: HubHandle,
    queue_len: usize,
    read_timeout: Duration,
) -> crate::Result<()> {
    stream.set_nodelay(true)?;

    match acceptor {
        Some(acceptor) => {
            let tls_stream = timeout(WRITE_WAIT, acceptor.accept(stream))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            debug!("TLS handshake complete with {}", peer);
            let ws = transport::accept(tls_stream).await?;
            serve(ws, peer, hub, queue_len, read_timeout).await
        }
        None => {
            let ws = transport::accept(stream).await?;
            serve(ws, peer, hub, queue_len, read_timeout).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tun_config_uses_server_address() {
        let config = ServerConfig {
            vpn_addr: "10.9.0.1/24".parse().unwrap(),
            mtu: 1280,
            tun_name: Some("wsvpn0".into()),
            ..ServerConfig::default()
        };
        let server = VpnServer::new(config).unwrap();
        let tun = server.tun_config();

        assert_eq!(tun.address, "10.9.0.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(tun.netmask, "255.255.255.0".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(tun.destination, None);
        assert_eq!(tun.mtu, 1280);
        assert_eq!(tun.name.as_deref(), Some("wsvpn0"));
        assert_eq!(server.pool().capacity(), 126);
    }

    #[test]
    fn test_bad_subnet_rejected() {
        let config = ServerConfig {
            vpn_addr: "10.9.0.1/30".parse().unwrap(),
            ..ServerConfig::default()
        };
        assert!(matches!(VpnServer::new(config), Err(crate::Error::Pool(_))));
    }
}
