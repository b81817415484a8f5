//! WebSocket transport using tokio-tungstenite

use super::TransportError;
use crate::protocol::{Envelope, ProtocolError, MAX_MESSAGE_SIZE, WRITE_WAIT, WS_PATH};
use futures::{Sink, SinkExt};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

/// Client side WebSocket over plain TCP or TLS
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frame limits shared by both ends
pub fn websocket_config() -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_MESSAGE_SIZE),
        ..Default::default()
    }
}

/// Dial `addr` and perform the WebSocket handshake for `url`.
///
/// `server_name` is the host the TLS certificate is checked against.
pub async fn connect(
    url: &str,
    addr: SocketAddr,
    server_name: &str,
    tls: Option<&TlsConnector>,
) -> Result<ClientStream, TransportError> {
    let tcp_stream = timeout(WRITE_WAIT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)??;
    tcp_stream.set_nodelay(true)?;

    let stream = match tls {
        Some(connector) => {
            let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
                TransportError::Tls(format!("Invalid server name {}: {}", server_name, e))
            })?;
            let tls_stream = timeout(WRITE_WAIT, connector.connect(name, tcp_stream))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            debug!("TLS handshake complete with {}", addr);
            MaybeTlsStream::Rustls(tls_stream)
        }
        None => MaybeTlsStream::Plain(tcp_stream),
    };

    let handshake =
        tokio_tungstenite::client_async_with_config(url, stream, Some(websocket_config()));
    let (ws_stream, _response) = timeout(WRITE_WAIT, handshake)
        .await
        .map_err(|_| TransportError::Timeout)??;

    Ok(ws_stream)
}

/// Accept a WebSocket upgrade; only `GET /ws` is served, other paths get 404
pub async fn accept<S>(stream: S) -> Result<WebSocketStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let check_path = |request: &Request, response: Response| {
        if request.uri().path() == WS_PATH {
            return Ok(response);
        }
        debug!("Rejecting upgrade on {}", request.uri().path());
        let mut error = ErrorResponse::new(Some(format!("no endpoint at {}", request.uri().path())));
        *error.status_mut() = StatusCode::NOT_FOUND;
        Err(error)
    };

    let ws_stream = timeout(
        WRITE_WAIT,
        tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            check_path,
            Some(websocket_config()),
        ),
    )
    .await
    .map_err(|_| TransportError::Timeout)??;

    Ok(ws_stream)
}

/// What a received WebSocket message means to the session
#[derive(Debug)]
pub enum Inbound {
    /// A protocol envelope
    Envelope(Envelope),
    /// Keepalive reply
    Pong,
    /// Ping or raw frame, handled by tungstenite
    Control,
    /// Peer sent a close frame
    Closed,
}

/// Classify one message; JSON envelopes are accepted in text or binary frames
pub fn decode_message(message: Message) -> Result<Inbound, ProtocolError> {
    match message {
        Message::Text(text) => Envelope::decode(text.as_bytes()).map(Inbound::Envelope),
        Message::Binary(data) => Envelope::decode(&data).map(Inbound::Envelope),
        Message::Pong(_) => Ok(Inbound::Pong),
        Message::Ping(_) | Message::Frame(_) => Ok(Inbound::Control),
        Message::Close(_) => Ok(Inbound::Closed),
    }
}

/// Drain `outbound` onto `sink`, one JSON text frame per envelope.
///
/// With `keepalive` set a ping is sent every period. When every sender of
/// `outbound` is gone a close frame is sent and the pump returns. Each write
/// is bounded by the write deadline.
pub async fn write_pump<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Envelope>,
    keepalive: Option<Duration>,
) -> Result<(), TransportError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let mut ticker = keepalive.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            envelope = outbound.recv() => match envelope {
                Some(envelope) => {
                    send_with_deadline(&mut sink, Message::Text(envelope.encode()?)).await?;
                }
                None => {
                    trace!("Outbound queue closed, sending close frame");
                    // Peer may already be gone
                    let _ = send_with_deadline(&mut sink, Message::Close(None)).await;
                    return Ok(());
                }
            },
            _ = next_tick(&mut ticker) => {
                send_with_deadline(&mut sink, Message::Ping(Vec::new())).await?;
            }
        }
    }
}

async fn send_with_deadline<S>(sink: &mut S, message: Message) -> Result<(), TransportError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    timeout(WRITE_WAIT, sink.send(message))
        .await
        .map_err(|_| TransportError::Timeout)??;
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ConnectionState;
    use bytes::Bytes;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;

    #[test]
    fn test_decode_text_and_binary() {
        let text = Message::Text(r#"{"connectionState":1,"payload":""}"#.to_string());
        match decode_message(text).unwrap() {
            Inbound::Envelope(envelope) => assert_eq!(envelope.state, ConnectionState::Connect),
            other => panic!("unexpected {:?}", other),
        }

        let binary = Message::Binary(br#"{"connectionState":3}"#.to_vec());
        match decode_message(binary).unwrap() {
            Inbound::Envelope(envelope) => {
                assert_eq!(envelope.state, ConnectionState::Disconnect)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_control_frames() {
        assert!(matches!(
            decode_message(Message::Pong(Vec::new())),
            Ok(Inbound::Pong)
        ));
        assert!(matches!(
            decode_message(Message::Ping(Vec::new())),
            Ok(Inbound::Control)
        ));
        assert!(matches!(
            decode_message(Message::Close(None)),
            Ok(Inbound::Closed)
        ));
        assert!(decode_message(Message::Text("garbage".into())).is_err());
    }

    #[tokio::test]
    async fn test_write_pump_sends_text_then_close() {
        let (sink_tx, mut sink_rx) = fmpsc::unbounded::<Message>();
        let sink = sink_tx.sink_map_err(|_| WsError::ConnectionClosed);
        let (tx, rx) = mpsc::channel(4);

        let pump = tokio::spawn(write_pump(sink, rx, None));
        tx.send(Envelope::connected(Bytes::from_static(b"abc")))
            .await
            .unwrap();
        drop(tx);
        pump.await.unwrap().unwrap();

        match sink_rx.next().await.unwrap() {
            Message::Text(text) => {
                let envelope = Envelope::decode(text.as_bytes()).unwrap();
                assert_eq!(envelope.payload, Bytes::from_static(b"abc"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(sink_rx.next().await, Some(Message::Close(None))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_pump_pings_on_keepalive() {
        let (sink_tx, mut sink_rx) = fmpsc::unbounded::<Message>();
        let sink = sink_tx.sink_map_err(|_| WsError::ConnectionClosed);
        let (tx, rx) = mpsc::channel(4);

        let pump = tokio::spawn(write_pump(sink, rx, Some(Duration::from_secs(3))));
        tokio::time::sleep(Duration::from_secs(7)).await;
        drop(tx);
        pump.await.unwrap().unwrap();

        let mut pings = 0;
        while let Some(message) = sink_rx.next().await {
            if matches!(message, Message::Ping(_)) {
                pings += 1;
            }
        }
        assert_eq!(pings, 2);
    }
}
