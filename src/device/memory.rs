//! In-memory tunnel device
//!
//! Packets injected through the [`MemoryPeer`] come out of the device's read
//! half; packets written to the device are observed on the peer. Lets the
//! server and client run without privileges.

use super::{PacketRead, PacketWrite, TunDevice};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use tokio::sync::mpsc;

/// Queue depth of the injection side
const INJECT_QUEUE: usize = 1024;

/// Test-side handle of an in-memory device
#[derive(Debug)]
pub struct MemoryPeer {
    inject: mpsc::Sender<Bytes>,
    observed: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryPeer {
    /// Make `packet` readable from the device, as if the OS had routed it there
    pub async fn inject(&self, packet: impl Into<Bytes>) -> bool {
        self.inject.send(packet.into()).await.is_ok()
    }

    /// Next packet written into the device
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.observed.recv().await
    }

    /// Next packet written into the device, if one is already queued
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.observed.try_recv().ok()
    }
}

/// Create an in-memory device and its peer handle
pub fn memory_device(name: &str, mtu: u16) -> (TunDevice, MemoryPeer) {
    let (inject_tx, inject_rx) = mpsc::channel(INJECT_QUEUE);
    let (observed_tx, observed_rx) = mpsc::unbounded_channel();

    let device = TunDevice::from_parts(
        name,
        mtu,
        Box::new(MemoryReader { rx: inject_rx }),
        Box::new(MemoryWriter { tx: observed_tx }),
    );
    let peer = MemoryPeer {
        inject: inject_tx,
        observed: observed_rx,
    };
    (device, peer)
}

struct MemoryReader {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl PacketRead for MemoryReader {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "memory peer dropped"))?;
        if packet.len() > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "packet of {} bytes exceeds read buffer of {}",
                    packet.len(),
                    buf.len()
                ),
            ));
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }
}

struct MemoryWriter {
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl PacketWrite for MemoryWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(packet))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory peer dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inject_and_observe() {
        let (device, mut peer) = memory_device("mem0", 1400);
        assert_eq!(device.name(), "mem0");

        let (mut reader, mut writer) = device.split();

        assert!(peer.inject(vec![1u8, 2, 3]).await);
        let mut buf = vec![0u8; reader.buffer_size()];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        writer.write(&[4, 5]).await.unwrap();
        assert_eq!(peer.recv().await.unwrap(), Bytes::from_static(&[4, 5]));
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropped_peer_breaks_device() {
        let (device, peer) = memory_device("mem0", 1400);
        let (mut reader, mut writer) = device.split();
        drop(peer);

        let mut buf = [0u8; 64];
        assert!(reader.read(&mut buf).await.is_err());
        assert!(writer.write(&[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_packet_is_rejected() {
        let (device, peer) = memory_device("mem0", 1400);
        let (mut reader, _writer) = device.split();

        assert!(peer.inject(vec![0x45u8; 100]).await);
        let mut buf = [0u8; 64];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // The next packet that fits still comes through whole
        assert!(peer.inject(vec![7u8; 64]).await);
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(n, 64);
        assert_eq!(buf, [7u8; 64]);
    }
}
