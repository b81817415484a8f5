//! Host integration seam
//!
//! Everything the client needs from the operating system goes through
//! [`Platform`], so a session can be driven against an in-memory device and
//! a recorded routing table.

use crate::device::{TunConfig, TunDevice};
use crate::route::{self, NetGateway};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Interface creation and routing table operations
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    /// Create and bring up a tunnel interface
    async fn create_tun(&self, config: TunConfig) -> crate::Result<TunDevice>;

    /// Current IPv4 default route
    async fn default_gateway(&self) -> crate::Result<NetGateway>;

    /// Add `dest` via `gateway` on `device`
    async fn add_route(&self, dest: Ipv4Net, gateway: Ipv4Addr, device: &str)
        -> crate::Result<()>;

    /// Delete the route to `dest`
    async fn delete_route(&self, dest: Ipv4Net) -> crate::Result<()>;
}

/// The real operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPlatform;

#[async_trait]
impl Platform for SystemPlatform {
    async fn create_tun(&self, config: TunConfig) -> crate::Result<TunDevice> {
        TunDevice::create(&config)
    }

    async fn default_gateway(&self) -> crate::Result<NetGateway> {
        route::default_gateway().await
    }

    async fn add_route(
        &self,
        dest: Ipv4Net,
        gateway: Ipv4Addr,
        device: &str,
    ) -> crate::Result<()> {
        route::add_route(dest, gateway, device).await
    }

    async fn delete_route(&self, dest: Ipv4Net) -> crate::Result<()> {
        route::delete_route(dest).await
    }
}
