//! VPN client
//!
//! Dials the server until it answers, asks for an address, brings up a
//! tunnel interface with it and relays packets until the session ends.
//! Whatever ends the session, the routes it installed are removed.

mod routes;

pub use routes::RouteSet;

use crate::config::ClientConfig;
use crate::device::TunConfig;
use crate::platform::{Platform, SystemPlatform};
use crate::protocol::{
    ConnectionState, Envelope, Flow, SessionState, DIAL_INTERVAL, WRITE_WAIT,
};
use crate::transport::{self, decode_message, write_pump, ClientStream, Inbound, TransportError};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use ipnet::Ipv4Net;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

/// Outbound queue depth towards the server
const OUTBOUND_QUEUE: usize = 256;

/// Queue depth towards the tunnel interface
const IFACE_QUEUE: usize = 1024;

/// Reason sent with the DISCONNECT on a local shutdown
const SHUTDOWN_REASON: &str = "client shutting down";

/// State of one connected session
struct Session {
    state: SessionState,
    address: Option<Ipv4Net>,
    outbound: mpsc::Sender<Envelope>,
    to_iface: Option<mpsc::Sender<Bytes>>,
    bridge: JoinSet<crate::Result<()>>,
}

/// VPN client
pub struct VpnClient<P: Platform = SystemPlatform> {
    config: ClientConfig,
    platform: P,
    tls: Option<TlsConnector>,
}

impl<P: Platform> VpnClient<P> {
    /// Create a client; builds the TLS connector when `tls` is on
    pub fn new(config: ClientConfig, platform: P) -> crate::Result<Self> {
        let tls = if config.tls {
            Some(transport::client_connector(config.tls_ca.as_deref())?)
        } else {
            None
        };
        Ok(Self {
            config,
            platform,
            tls,
        })
    }

    /// Resolve the configured server to an IPv4 socket address
    pub async fn resolve(&self) -> crate::Result<SocketAddrV4> {
        let host = (self.config.server.as_str(), self.config.port);
        let mut addrs = tokio::net::lookup_host(host).await.map_err(|e| {
            crate::Error::Config(format!("Failed to resolve {}: {}", self.config.server, e))
        })?;
        addrs
            .find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| {
                crate::Error::Config(format!("{} has no IPv4 address", self.config.server))
            })
    }

    /// Run one session until `shutdown` resolves, the server goes away or
    /// rejects us. Routes are always restored before returning.
    pub async fn run<F>(&self, shutdown: F) -> crate::Result<()>
    where
        F: Future<Output = ()>,
    {
        let server = self.resolve().await?;
        info!("Server {} resolved to {}", self.config.server, server.ip());

        let gateway = self.platform.default_gateway().await?;
        info!(
            "Default route via {} dev {}",
            gateway.gateway, gateway.device
        );
        let mut routes = RouteSet::new(gateway);

        tokio::pin!(shutdown);
        let result = self.session(server, &mut routes, &mut shutdown).await;

        routes.teardown(&self.platform).await;
        match &result {
            Ok(()) => info!("Session closed"),
            Err(e) => warn!("Session ended: {}", e),
        }
        result
    }

    async fn session<F>(
        &self,
        server: SocketAddrV4,
        routes: &mut RouteSet,
        shutdown: &mut Pin<&mut F>,
    ) -> crate::Result<()>
    where
        F: Future<Output = ()>,
    {
        routes.add_host_route(&self.platform, *server.ip()).await?;

        let ws = tokio::select! {
            ws = self.dial(server) => ws,
            _ = &mut *shutdown => {
                info!("Interrupted before connecting");
                return Ok(());
            }
        };

        let (sink, mut stream) = ws.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let mut writer = tokio::spawn(write_pump(sink, rx, Some(self.config.ping_interval())));

        tx.send(Envelope::connect())
            .await
            .map_err(|_| crate::Error::ConnectionClosed)?;
        debug!("Sent CONNECT");

        let mut session = Session {
            state: SessionState::Init,
            address: None,
            outbound: tx.clone(),
            to_iface: None,
            bridge: JoinSet::new(),
        };

        let mut writer_done = false;
        let result = tokio::select! {
            res = self.read_loop(&mut stream, &mut session, routes) => res,
            res = &mut writer => {
                writer_done = true;
                match res {
                    Ok(inner) => inner.map_err(crate::Error::from),
                    Err(e) => Err(crate::Error::Io(std::io::Error::other(e))),
                }
            }
            _ = &mut *shutdown => {
                info!("Interrupted, disconnecting");
                let _ = tx.try_send(Envelope::disconnect(SHUTDOWN_REASON));
                Ok(())
            }
        };

        if let Some(address) = session.address {
            info!("Releasing {}", address);
        }
        // Stops the bridge tasks and releases their queue senders
        drop(session);
        drop(tx);
        if !writer_done && timeout(WRITE_WAIT, &mut writer).await.is_err() {
            writer.abort();
        }

        result
    }

    async fn dial(&self, server: SocketAddrV4) -> ClientStream {
        let url = self.config.url();
        let mut ticker = tokio::time::interval(DIAL_INTERVAL);
        // A slow failed attempt must not be followed by a burst of retries
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            info!("Connecting to {} ({})", url, server);
            match transport::connect(
                &url,
                SocketAddr::V4(server),
                &self.config.server,
                self.tls.as_ref(),
            )
            .await
            {
                Ok(ws) => {
                    info!("Connected to {}", url);
                    return ws;
                }
                Err(e) => warn!("Dial {} failed: {}; retrying in {:?}", url, e, DIAL_INTERVAL),
            }
        }
    }

    async fn read_loop<St>(
        &self,
        stream: &mut St,
        session: &mut Session,
        routes: &mut RouteSet,
    ) -> crate::Result<()>
    where
        St: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let pong_timeout = self.config.pong_timeout();
        let mut deadline = Instant::now() + pong_timeout;

        loop {
            let next = tokio::select! {
                next = timeout_at(deadline, stream.next()) => next,
                Some(res) = session.bridge.join_next(), if !session.bridge.is_empty() => {
                    crate::task_result(res, "tunnel bridge")?;
                    return Err(crate::Error::Device("tunnel bridge stopped".into()));
                }
            };

            let message = match next {
                Err(_) => {
                    warn!("No pong from server in {:?}", pong_timeout);
                    return Err(crate::Error::Timeout);
                }
                Ok(None) => return Err(crate::Error::ConnectionClosed),
                Ok(Some(message)) => message.map_err(TransportError::from)?,
            };

            match decode_message(message)? {
                Inbound::Pong => deadline = Instant::now() + pong_timeout,
                Inbound::Envelope(envelope) => {
                    if self.dispatch(session, routes, envelope).await? == Flow::Close {
                        return Ok(());
                    }
                }
                Inbound::Closed => return Err(crate::Error::ConnectionClosed),
                Inbound::Control => {}
            }
        }
    }

    async fn dispatch(
        &self,
        session: &mut Session,
        routes: &mut RouteSet,
        envelope: Envelope,
    ) -> crate::Result<Flow> {
        match (session.state, envelope.state) {
            (SessionState::Disconnect, _) => Ok(Flow::Close),
            (SessionState::Init, ConnectionState::Disconnect) => {
                session.state = SessionState::Disconnect;
                Err(crate::Error::Rejected(envelope.reason()))
            }
            (SessionState::Connected, ConnectionState::Disconnect) => {
                info!("Server ended the session: {}", envelope.reason());
                session.state = SessionState::Disconnect;
                Ok(Flow::Close)
            }
            (SessionState::Init, ConnectionState::Connected) => {
                match envelope.assigned_address() {
                    Ok(address) => {
                        self.establish(session, routes, address).await?;
                    }
                    Err(e) => warn!("Ignoring CONNECTED before address assignment: {}", e),
                }
                Ok(Flow::Continue)
            }
            (SessionState::Connected, ConnectionState::Connected) => {
                if let Some(to_iface) = &session.to_iface {
                    if !envelope.payload.is_empty() {
                        to_iface
                            .send(envelope.payload)
                            .await
                            .map_err(|_| crate::Error::Device("tunnel writer stopped".into()))?;
                    }
                }
                Ok(Flow::Continue)
            }
            (state, other) => {
                debug!("Ignoring {:?} in {:?}", other, state);
                Ok(Flow::Continue)
            }
        }
    }

    async fn establish(
        &self,
        session: &mut Session,
        routes: &mut RouteSet,
        address: Ipv4Net,
    ) -> crate::Result<()> {
        let peer = point_to_point_peer(address)?;
        let config = TunConfig::new(address)
            .with_destination(peer)
            .with_name(self.config.tun_name.clone())
            .with_mtu(self.config.mtu);

        let device = self.platform.create_tun(config).await?;
        let name = device.name().to_string();
        info!("Assigned {} on {} (peer {})", address, name, peer);

        if self.config.redirect_gateway {
            routes.redirect_default(&self.platform, peer, &name).await?;
        }

        let (reader, writer) = device.split();
        let (to_iface_tx, to_iface_rx) = mpsc::channel(IFACE_QUEUE);
        session
            .bridge
            .spawn(reader.forward(session.outbound.clone(), Envelope::connected));
        session.bridge.spawn(writer.drain(to_iface_rx));

        session.to_iface = Some(to_iface_tx);
        session.address = Some(address);
        session.state = SessionState::Connected;
        Ok(())
    }
}

/// The even address just below the assigned one is the server's side of
/// the point-to-point link
fn point_to_point_peer(address: Ipv4Net) -> crate::Result<Ipv4Addr> {
    let host = u32::from(address.addr());
    let peer = Ipv4Addr::from(host.wrapping_sub(1));
    if host == 0 || !address.contains(&peer) || peer == address.network() {
        return Err(crate::Error::Protocol(
            crate::protocol::ProtocolError::InvalidAddress(address.to_string()),
        ));
    }
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_to_point_peer() {
        let address: Ipv4Net = "10.8.0.3/24".parse().unwrap();
        assert_eq!(
            point_to_point_peer(address).unwrap(),
            Ipv4Addr::new(10, 8, 0, 2)
        );

        let address: Ipv4Net = "10.8.0.253/24".parse().unwrap();
        assert_eq!(
            point_to_point_peer(address).unwrap(),
            Ipv4Addr::new(10, 8, 0, 252)
        );
    }

    #[test]
    fn test_point_to_point_peer_rejects_network_edge() {
        assert!(point_to_point_peer("10.8.0.1/24".parse().unwrap()).is_err());
        assert!(point_to_point_peer("10.8.1.0/24".parse().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let config = ClientConfig {
            server: "127.0.0.1".into(),
            port: 9,
            ..ClientConfig::default()
        };
        let client = VpnClient::new(config, SystemPlatform).unwrap();
        let addr = client.resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:9".parse().unwrap());
    }
}
