//! OS tunnel interface backed by the `tun` crate

use super::{PacketRead, PacketWrite, TunConfig, TunDevice};
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tun::{AbstractDevice, Configuration, DeviceReader, DeviceWriter};

pub(super) fn create(config: &TunConfig) -> crate::Result<TunDevice> {
    let mut tun_config = Configuration::default();
    tun_config
        .address(config.address)
        .netmask(config.netmask)
        .mtu(config.mtu)
        .up();

    if let Some(destination) = config.destination {
        tun_config.destination(destination);
    }

    if let Some(ref name) = config.name {
        #[allow(deprecated)]
        tun_config.name(name);
    }

    #[cfg(target_os = "linux")]
    tun_config.platform_config(|platform_config| {
        platform_config.ensure_root_privileges(true);
    });

    let device = tun::create_as_async(&tun_config)
        .map_err(|e| crate::Error::Device(format!("Failed to create TUN device: {}", e)))?;

    let name = device
        .tun_name()
        .map_err(|e| crate::Error::Device(format!("Failed to get TUN name: {}", e)))?;

    info!(
        "Created TUN device {} with {}/{} mtu {}",
        name, config.address, config.netmask, config.mtu
    );

    // tun returns (writer, reader)
    let (writer, reader) = device
        .split()
        .map_err(|e| crate::Error::Device(format!("Failed to split TUN device: {}", e)))?;

    Ok(TunDevice::from_parts(
        name,
        config.mtu,
        Box::new(SystemReader(reader)),
        Box::new(SystemWriter(writer)),
    ))
}

struct SystemReader(DeviceReader);

#[async_trait]
impl PacketRead for SystemReader {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }
}

struct SystemWriter(DeviceWriter);

#[async_trait]
impl PacketWrite for SystemWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.0.write_all(packet).await
    }
}
