//! Per-client connection actor
//!
//! Each accepted socket gets one [`Connection`]: a read pump that drives the
//! session state machine and a spawned write pump draining a bounded
//! outbound queue. Both the hub and the actor itself feed that queue.

use super::hub::{ClientHandle, HubHandle};
use crate::protocol::{
    ConnectionState, Envelope, Flow, SessionState, POOL_EXHAUSTED_REASON, WRITE_WAIT,
};
use crate::transport::{decode_message, write_pump, Inbound, TransportError};
use futures::{Stream, StreamExt};
use ipnet::Ipv4Net;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Session state of one client
#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    state: SessionState,
    address: Option<Ipv4Net>,
    outbound: mpsc::Sender<Envelope>,
    hub: HubHandle,
}

impl Connection {
    /// New actor in `Init` for a socket from `peer`
    pub fn new(peer: SocketAddr, outbound: mpsc::Sender<Envelope>, hub: HubHandle) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            state: SessionState::Init,
            address: None,
            outbound,
            hub,
        }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Address assigned to this client, once connected
    pub fn address(&self) -> Option<Ipv4Net> {
        self.address
    }

    /// Apply one inbound envelope to the session
    pub async fn dispatch(&mut self, envelope: Envelope) -> crate::Result<Flow> {
        match (self.state, envelope.state) {
            (SessionState::Disconnect, _) => Ok(Flow::Close),
            (_, ConnectionState::Disconnect) => {
                info!("{} disconnected: {}", self.peer, envelope.reason());
                self.state = SessionState::Disconnect;
                Ok(Flow::Close)
            }
            (SessionState::Init, ConnectionState::Connect) => self.assign(),
            (SessionState::Init, other) => {
                debug!("Ignoring {:?} from {} before handshake", other, self.peer);
                Ok(Flow::Continue)
            }
            (SessionState::Connected, ConnectionState::Connected) => {
                if !envelope.payload.is_empty() {
                    self.hub.forward(envelope.payload).await?;
                }
                Ok(Flow::Continue)
            }
            (SessionState::Connected, other) => {
                debug!("Ignoring {:?} from connected client {}", other, self.peer);
                Ok(Flow::Continue)
            }
        }
    }

    fn assign(&mut self) -> crate::Result<Flow> {
        let address = match self.hub.pool().allocate() {
            Ok(address) => address,
            Err(e) => {
                warn!("Rejecting {}: {}", self.peer, e);
                let _ = self
                    .outbound
                    .try_send(Envelope::disconnect(POOL_EXHAUSTED_REASON));
                self.state = SessionState::Disconnect;
                return Err(e.into());
            }
        };

        // The assignment must be queued before the hub can route to us
        if self.outbound.try_send(Envelope::assignment(address)).is_err() {
            self.hub.pool().release(address.addr());
            return Err(crate::Error::ConnectionClosed);
        }

        let client = ClientHandle {
            id: self.id,
            address,
            outbound: self.outbound.clone(),
        };
        if let Err(e) = self.hub.register(client) {
            self.hub.pool().release(address.addr());
            return Err(e);
        }

        info!("Assigned {} to {}", address, self.peer);
        self.address = Some(address);
        self.state = SessionState::Connected;
        Ok(Flow::Continue)
    }

    async fn read_pump<St>(&mut self, stream: &mut St, read_timeout: Duration) -> crate::Result<()>
    where
        St: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let message = match timeout(read_timeout, stream.next()).await {
                Err(_) => {
                    warn!("{} silent for {:?}, closing", self.peer, read_timeout);
                    return Err(crate::Error::Timeout);
                }
                Ok(None) => return Ok(()),
                Ok(Some(message)) => message.map_err(TransportError::from)?,
            };

            match decode_message(message)? {
                Inbound::Envelope(envelope) => {
                    if self.dispatch(envelope).await? == Flow::Close {
                        return Ok(());
                    }
                }
                Inbound::Closed => return Ok(()),
                Inbound::Pong | Inbound::Control => {}
            }
        }
    }

    /// Leave the registry and give the address back; safe to call repeatedly
    pub fn teardown(&mut self) {
        self.state = SessionState::Disconnect;
        if let Some(address) = self.address.take() {
            self.hub.unregister(self.id, address.addr());
        }
    }
}

/// Run one client session to completion
pub async fn serve<S>(
    ws: WebSocketStream<S>,
    peer: SocketAddr,
    hub: HubHandle,
    queue_len: usize,
    read_timeout: Duration,
) -> crate::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();
    let (tx, rx) = mpsc::channel(queue_len);
    let mut writer = tokio::spawn(write_pump(sink, rx, None));
    let mut connection = Connection::new(peer, tx, hub);

    let mut writer_done = false;
    let result = tokio::select! {
        res = connection.read_pump(&mut stream, read_timeout) => res,
        res = &mut writer => {
            writer_done = true;
            match res {
                Ok(inner) => inner.map_err(crate::Error::from),
                Err(e) => Err(crate::Error::Io(std::io::Error::other(e))),
            }
        }
    };

    connection.teardown();
    drop(connection);

    // Flush whatever is still queued (a DISCONNECT, say) and the close frame
    if !writer_done && timeout(WRITE_WAIT, &mut writer).await.is_err() {
        writer.abort();
    }

    result
}
