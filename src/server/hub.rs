//! Routing hub
//!
//! A single task owns the registry of connected clients, keyed by assigned
//! address, so registration, removal and routing need no lock. Two more
//! tasks bridge the tunnel interface: one reads packets and hands them to
//! the hub loop, one writes packets relayed by clients.

use crate::device::TunDevice;
use crate::packet;
use crate::pool::AddressPool;
use crate::protocol::Envelope;
use bytes::Bytes;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Queue depth between the interface bridges and the hub
pub const DEFAULT_IFACE_QUEUE: usize = 1024;

/// A registered client: its address and the queue feeding its socket
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Unique per accepted connection
    pub id: u64,
    /// Assigned address
    pub address: Ipv4Net,
    /// Outbound queue of the connection's write pump
    pub outbound: mpsc::Sender<Envelope>,
}

enum HubEvent {
    Register(ClientHandle),
    Unregister { id: u64, address: Ipv4Addr },
    Count(oneshot::Sender<usize>),
}

/// Cloneable access to a running hub
#[derive(Debug, Clone)]
pub struct HubHandle {
    events: mpsc::UnboundedSender<HubEvent>,
    to_iface: mpsc::Sender<Bytes>,
    pool: Arc<AddressPool>,
}

impl std::fmt::Debug for HubEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubEvent::Register(client) => write!(f, "Register({})", client.address),
            HubEvent::Unregister { id, address } => write!(f, "Unregister({}, {})", id, address),
            HubEvent::Count(_) => write!(f, "Count"),
        }
    }
}

impl HubHandle {
    /// Shared address pool
    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    /// Make `client` the owner of its address
    pub fn register(&self, client: ClientHandle) -> crate::Result<()> {
        self.events
            .send(HubEvent::Register(client))
            .map_err(|_| crate::Error::ConnectionClosed)
    }

    /// Drop the entry for `address` if it still belongs to connection `id`,
    /// returning the address to the pool
    pub fn unregister(&self, id: u64, address: Ipv4Addr) {
        if self
            .events
            .send(HubEvent::Unregister { id, address })
            .is_err()
        {
            // Hub is gone; nothing routes to this address any more
            self.pool.release(address);
        }
    }

    /// Queue a client packet for the tunnel interface
    pub async fn forward(&self, packet: Bytes) -> crate::Result<()> {
        self.to_iface
            .send(packet)
            .await
            .map_err(|_| crate::Error::ConnectionClosed)
    }

    /// Number of registered clients, as seen after every earlier event
    pub async fn active_clients(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.events.send(HubEvent::Count(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Registry owner
pub struct Hub {
    registry: HashMap<Ipv4Addr, ClientHandle>,
    pool: Arc<AddressPool>,
}

impl Hub {
    /// Start the hub and both interface bridges.
    ///
    /// The returned task finishes when any of the three stops; an interface
    /// failure surfaces as its error.
    pub fn spawn(
        pool: Arc<AddressPool>,
        device: TunDevice,
        iface_queue: usize,
    ) -> (HubHandle, JoinHandle<crate::Result<()>>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (to_iface_tx, to_iface_rx) = mpsc::channel(iface_queue);
        let (from_iface_tx, from_iface_rx) = mpsc::channel(iface_queue);

        info!("Bridging TUN device {}", device.name());
        let (reader, writer) = device.split();

        let hub = Hub {
            registry: HashMap::new(),
            pool: Arc::clone(&pool),
        };

        let mut reader_task = tokio::spawn(reader.forward(from_iface_tx, |packet| packet));
        let mut writer_task = tokio::spawn(writer.drain(to_iface_rx));
        let mut hub_task = tokio::spawn(hub.run(events_rx, from_iface_rx));

        let supervisor = tokio::spawn(async move {
            let _guard = AbortOnDrop(vec![
                reader_task.abort_handle(),
                writer_task.abort_handle(),
                hub_task.abort_handle(),
            ]);
            tokio::select! {
                res = &mut reader_task => crate::task_result(res, "interface reader"),
                res = &mut writer_task => crate::task_result(res, "interface writer"),
                res = &mut hub_task => crate::task_result(res, "hub"),
            }
        });

        let handle = HubHandle {
            events: events_tx,
            to_iface: to_iface_tx,
            pool,
        };
        (handle, supervisor)
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<HubEvent>,
        mut from_iface: mpsc::Receiver<Bytes>,
    ) -> crate::Result<()> {
        loop {
            tokio::select! {
                biased;

                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        debug!("All hub handles dropped, stopping");
                        return Ok(());
                    }
                },
                packet = from_iface.recv() => match packet {
                    Some(packet) => self.route(packet),
                    None => return Err(crate::Error::Device("interface reader stopped".into())),
                },
            }
        }
    }

    fn handle_event(&mut self, event: HubEvent) {
        trace!("Hub event {:?}", event);
        match event {
            HubEvent::Register(client) => {
                let address = client.address.addr();
                if let Some(previous) = self.registry.insert(address, client) {
                    warn!(
                        "Address {} re-registered, replacing connection {}",
                        address, previous.id
                    );
                }
                info!(
                    "Registered client {} ({} active)",
                    address,
                    self.registry.len()
                );
            }
            HubEvent::Unregister { id, address } => {
                let owned = self
                    .registry
                    .get(&address)
                    .is_some_and(|client| client.id == id);
                if !owned {
                    debug!("Stale unregister of {} by connection {}", address, id);
                    return;
                }
                self.registry.remove(&address);
                self.pool.release(address);
                info!(
                    "Unregistered client {} ({} active)",
                    address,
                    self.registry.len()
                );
            }
            HubEvent::Count(reply) => {
                let _ = reply.send(self.registry.len());
            }
        }
    }

    fn route(&self, packet: Bytes) {
        let Some(destination) = packet::ipv4_destination(&packet) else {
            trace!("Dropping non-IPv4 packet ({} bytes)", packet.len());
            return;
        };

        let Some(client) = self.registry.get(&destination) else {
            debug!(
                "No client for {}, dropping {} bytes",
                destination,
                packet.len()
            );
            return;
        };

        match client.outbound.try_send(Envelope::connected(packet)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue for {} full, dropping packet", destination);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Client {} is closing, dropping packet", destination);
            }
        }
    }
}

/// Aborts the bridge tasks when the supervisor finishes or is itself aborted
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory_device;
    use crate::packet::test_packet;
    use crate::protocol::ConnectionState;
    use std::time::Duration;
    use tokio::time::timeout;

    fn start() -> (HubHandle, JoinHandle<crate::Result<()>>, crate::device::MemoryPeer) {
        let pool = Arc::new(AddressPool::with_server("10.8.0.1/24".parse().unwrap()).unwrap());
        let (device, peer) = memory_device("hub0", 1400);
        let (handle, task) = Hub::spawn(pool, device, 16);
        (handle, task, peer)
    }

    fn client(handle: &HubHandle, id: u64) -> (ClientHandle, mpsc::Receiver<Envelope>) {
        let address = handle.pool().allocate().unwrap();
        let (tx, rx) = mpsc::channel(4);
        (
            ClientHandle {
                id,
                address,
                outbound: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_routes_to_owner_only() {
        let (handle, _task, peer) = start();
        let (a, mut a_rx) = client(&handle, 1);
        let (b, mut b_rx) = client(&handle, 2);
        let b_addr = b.address.addr();
        handle.register(a).unwrap();
        handle.register(b).unwrap();
        assert_eq!(handle.active_clients().await, 2);

        let packet = test_packet(Ipv4Addr::new(1, 1, 1, 1), b_addr, b"to b");
        assert!(peer.inject(packet.clone()).await);

        let envelope = timeout(Duration::from_secs(1), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.state, ConnectionState::Connected);
        assert_eq!(envelope.payload, Bytes::from(packet));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_destination_dropped() {
        let (handle, task, peer) = start();
        let (a, mut a_rx) = client(&handle, 1);
        handle.register(a).unwrap();

        let stray = test_packet(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(10, 8, 0, 99), b"");
        assert!(peer.inject(stray).await);
        assert!(peer.inject(vec![0x60u8; 40]).await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.active_clients().await, 1);
        assert!(a_rx.try_recv().is_err());
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_unregister_releases_once() {
        let (handle, _task, _peer) = start();
        let (a, _a_rx) = client(&handle, 7);
        let address = a.address.addr();
        handle.register(a).unwrap();
        assert_eq!(handle.pool().in_use(), 1);

        handle.unregister(7, address);
        handle.unregister(7, address);
        assert_eq!(handle.active_clients().await, 0);
        assert_eq!(handle.pool().in_use(), 0);
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_new_owner() {
        let (handle, _task, _peer) = start();
        let (a, _a_rx) = client(&handle, 1);
        let address = a.address;
        handle.register(a).unwrap();
        handle.unregister(1, address.addr());

        // Address is reused by a newer connection
        let (b, _b_rx) = client(&handle, 2);
        assert_eq!(b.address, address);
        handle.register(b).unwrap();

        handle.unregister(1, address.addr());
        assert_eq!(handle.active_clients().await, 1);
        assert_eq!(handle.pool().in_use(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (handle, task, peer) = start();
        let address = handle.pool().allocate().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        handle
            .register(ClientHandle {
                id: 1,
                address,
                outbound: tx,
            })
            .unwrap();

        for _ in 0..3 {
            let packet = test_packet(Ipv4Addr::new(1, 1, 1, 1), address.addr(), b"x");
            assert!(peer.inject(packet).await);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.active_clients().await, 1);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_forward_reaches_interface() {
        let (handle, _task, mut peer) = start();
        let packet = test_packet(Ipv4Addr::new(10, 8, 0, 3), Ipv4Addr::new(8, 8, 8, 8), b"out");
        handle.forward(Bytes::from(packet.clone())).await.unwrap();

        let written = timeout(Duration::from_secs(1), peer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written, Bytes::from(packet));
    }

    #[tokio::test]
    async fn test_interface_failure_ends_hub() {
        let (_handle, task, peer) = start();
        drop(peer);

        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(crate::Error::Device(_))));
    }
}
