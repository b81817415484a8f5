//! Tunnel interface abstraction
//!
//! A [`TunDevice`] is a named interface with an MTU and two packet halves.
//! The OS-backed implementation lives in `system`; an in-memory pair used by
//! tests and embedders lives in `memory`.

mod memory;
mod system;

pub use memory::{memory_device, MemoryPeer};

use async_trait::async_trait;
use bytes::Bytes;
use ipnet::Ipv4Net;
use std::io;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;

/// Read half of a tunnel interface: one call yields one IP packet
#[async_trait]
pub trait PacketRead: Send {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write half of a tunnel interface: one call injects one IP packet
#[async_trait]
pub trait PacketWrite: Send {
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// Tunnel interface configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunConfig {
    /// Interface name; the OS assigns one if `None`
    pub name: Option<String>,
    /// Local address of the interface
    pub address: Ipv4Addr,
    /// Netmask of the virtual subnet
    pub netmask: Ipv4Addr,
    /// Point-to-point peer, if any
    pub destination: Option<Ipv4Addr>,
    /// Interface MTU
    pub mtu: u16,
}

impl TunConfig {
    /// Interface carrying `address` with the mask of its prefix
    pub fn new(address: Ipv4Net) -> Self {
        Self {
            name: None,
            address: address.addr(),
            netmask: address.netmask(),
            destination: None,
            mtu: 1400,
        }
    }

    /// Set the device name
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    /// Set the point-to-point peer
    pub fn with_destination(mut self, destination: Ipv4Addr) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Set the MTU
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }
}

/// A tunnel interface ready to be split into its halves
pub struct TunDevice {
    name: String,
    mtu: u16,
    reader: Box<dyn PacketRead>,
    writer: Box<dyn PacketWrite>,
}

impl TunDevice {
    /// Create an OS tunnel interface
    pub fn create(config: &TunConfig) -> crate::Result<Self> {
        system::create(config)
    }

    /// Assemble a device from arbitrary packet halves
    pub fn from_parts(
        name: impl Into<String>,
        mtu: u16,
        reader: Box<dyn PacketRead>,
        writer: Box<dyn PacketWrite>,
    ) -> Self {
        Self {
            name: name.into(),
            mtu,
            reader,
            writer,
        }
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured MTU
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Buffer size for reading packets (MTU + packet info header)
    pub fn buffer_size(&self) -> usize {
        self.mtu as usize + tun::PACKET_INFORMATION_LENGTH
    }

    /// Split the device into read and write halves
    pub fn split(self) -> (TunReader, TunWriter) {
        let buffer_size = self.buffer_size();
        (
            TunReader {
                inner: self.reader,
                buffer_size,
            },
            TunWriter { inner: self.writer },
        )
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .finish()
    }
}

/// Read half of a split device
pub struct TunReader {
    inner: Box<dyn PacketRead>,
    buffer_size: usize,
}

impl TunReader {
    /// Recommended buffer size
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Read one packet
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_packet(buf).await
    }

    /// Read packets until the interface fails or `tx` is closed, handing
    /// each one to `tx` wrapped by `wrap`
    pub async fn forward<T, F>(mut self, tx: mpsc::Sender<T>, wrap: F) -> crate::Result<()>
    where
        F: Fn(Bytes) -> T,
    {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let n = self
                .read(&mut buf)
                .await
                .map_err(|e| crate::Error::Device(format!("Failed to read from TUN: {}", e)))?;
            if n == 0 {
                return Err(crate::Error::Device("TUN device closed".into()));
            }
            if tx.send(wrap(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Write half of a split device
pub struct TunWriter {
    inner: Box<dyn PacketWrite>,
}

impl TunWriter {
    /// Write one packet
    pub async fn write(&mut self, packet: &[u8]) -> io::Result<()> {
        self.inner.write_packet(packet).await
    }

    /// Write every packet received on `rx` until all its senders are gone
    pub async fn drain(mut self, mut rx: mpsc::Receiver<Bytes>) -> crate::Result<()> {
        while let Some(packet) = rx.recv().await {
            self.write(&packet)
                .await
                .map_err(|e| crate::Error::Device(format!("Failed to write to TUN: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_cidr() {
        let config = TunConfig::new("10.8.0.3/24".parse().unwrap())
            .with_destination(Ipv4Addr::new(10, 8, 0, 2))
            .with_mtu(1300);

        assert_eq!(config.address, Ipv4Addr::new(10, 8, 0, 3));
        assert_eq!(config.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(config.destination, Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(config.mtu, 1300);
        assert_eq!(config.name, None);
    }
}
