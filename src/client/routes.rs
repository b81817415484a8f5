//! Routes installed by one client session
//!
//! Every change made to the routing table is recorded here so that teardown
//! can undo exactly those changes, newest first.

use crate::platform::Platform;
use crate::route::NetGateway;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::{info, warn};

/// `0.0.0.0/0`
fn default_route() -> Ipv4Net {
    Ipv4Net::default()
}

/// `0.0.0.0/1` and `128.0.0.0/1`: together they cover everything and are
/// more specific than the default route
fn half_spaces() -> impl Iterator<Item = Ipv4Net> {
    default_route().subnets(1).into_iter().flatten()
}

/// Routing changes owned by a client session
#[derive(Debug)]
pub struct RouteSet {
    gateway: NetGateway,
    installed: Vec<Ipv4Net>,
    default_removed: bool,
}

impl RouteSet {
    /// Start tracking with the default route found at startup
    pub fn new(gateway: NetGateway) -> Self {
        Self {
            gateway,
            installed: Vec::new(),
            default_removed: false,
        }
    }

    /// Routes currently installed, oldest first
    pub fn installed(&self) -> &[Ipv4Net] {
        &self.installed
    }

    /// Whether the default route is currently deleted
    pub fn default_removed(&self) -> bool {
        self.default_removed
    }

    /// Pin `host` to the original gateway so tunnel traffic never loops
    pub async fn add_host_route<P: Platform>(
        &mut self,
        platform: &P,
        host: Ipv4Addr,
    ) -> crate::Result<()> {
        let gateway = self.gateway.gateway;
        let device = self.gateway.device.clone();
        self.add(platform, Ipv4Net::from(host), gateway, &device)
            .await
    }

    /// Send all traffic to `peer` on `tun` using two half-space routes
    pub async fn redirect_default<P: Platform>(
        &mut self,
        platform: &P,
        peer: Ipv4Addr,
        tun: &str,
    ) -> crate::Result<()> {
        platform.delete_route(default_route()).await?;
        self.default_removed = true;

        for half in half_spaces() {
            self.add(platform, half, peer, tun).await?;
        }
        info!("Default route redirected through {} via {}", tun, peer);
        Ok(())
    }

    /// Remove every recorded route, newest first, then restore the default
    /// route. Failures are logged and do not stop the rest.
    pub async fn teardown<P: Platform>(&mut self, platform: &P) {
        while let Some(dest) = self.installed.pop() {
            if let Err(e) = platform.delete_route(dest).await {
                warn!("Failed to remove route {}: {}", dest, e);
            }
        }

        if self.default_removed {
            let NetGateway { gateway, device } = &self.gateway;
            match platform.add_route(default_route(), *gateway, device).await {
                Ok(()) => info!("Restored default route via {} dev {}", gateway, device),
                Err(e) => warn!("Failed to restore default route: {}", e),
            }
            self.default_removed = false;
        }
    }

    async fn add<P: Platform>(
        &mut self,
        platform: &P,
        dest: Ipv4Net,
        via: Ipv4Addr,
        device: &str,
    ) -> crate::Result<()> {
        platform.add_route(dest, via, device).await?;
        self.installed.push(dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{memory_device, TunConfig, TunDevice};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Add(Ipv4Net, Ipv4Addr, String),
        Delete(Ipv4Net),
    }

    #[derive(Default)]
    struct RecordingPlatform {
        ops: Mutex<Vec<Op>>,
        fail_add: Option<Ipv4Net>,
    }

    impl RecordingPlatform {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Platform for RecordingPlatform {
        async fn create_tun(&self, config: TunConfig) -> crate::Result<TunDevice> {
            let (device, _peer) = memory_device("tun9", config.mtu);
            Ok(device)
        }

        async fn default_gateway(&self) -> crate::Result<NetGateway> {
            Ok(gateway())
        }

        async fn add_route(
            &self,
            dest: Ipv4Net,
            gateway: Ipv4Addr,
            device: &str,
        ) -> crate::Result<()> {
            if self.fail_add == Some(dest) {
                return Err(crate::Error::Route(format!("cannot add {}", dest)));
            }
            self.ops
                .lock()
                .unwrap()
                .push(Op::Add(dest, gateway, device.to_string()));
            Ok(())
        }

        async fn delete_route(&self, dest: Ipv4Net) -> crate::Result<()> {
            self.ops.lock().unwrap().push(Op::Delete(dest));
            Ok(())
        }
    }

    fn gateway() -> NetGateway {
        NetGateway {
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            device: "eth0".into(),
        }
    }

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_half_spaces() {
        let halves: Vec<_> = half_spaces().collect();
        assert_eq!(halves, vec![net("0.0.0.0/1"), net("128.0.0.0/1")]);
        assert_eq!(default_route(), net("0.0.0.0/0"));
    }

    #[tokio::test]
    async fn test_install_and_teardown_order() {
        let platform = RecordingPlatform::default();
        let mut routes = RouteSet::new(gateway());
        let peer = Ipv4Addr::new(10, 8, 0, 2);

        routes
            .add_host_route(&platform, Ipv4Addr::new(203, 0, 113, 7))
            .await
            .unwrap();
        routes
            .redirect_default(&platform, peer, "tun9")
            .await
            .unwrap();
        assert_eq!(routes.installed().len(), 3);
        assert!(routes.default_removed());

        routes.teardown(&platform).await;
        assert!(routes.installed().is_empty());
        assert!(!routes.default_removed());

        let gw = Ipv4Addr::new(192, 168, 1, 1);
        assert_eq!(
            platform.ops(),
            vec![
                Op::Add(net("203.0.113.7/32"), gw, "eth0".into()),
                Op::Delete(net("0.0.0.0/0")),
                Op::Add(net("0.0.0.0/1"), peer, "tun9".into()),
                Op::Add(net("128.0.0.0/1"), peer, "tun9".into()),
                Op::Delete(net("128.0.0.0/1")),
                Op::Delete(net("0.0.0.0/1")),
                Op::Delete(net("203.0.113.7/32")),
                Op::Add(net("0.0.0.0/0"), gw, "eth0".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_partial_redirect_is_undone() {
        let platform = RecordingPlatform {
            fail_add: Some(net("128.0.0.0/1")),
            ..Default::default()
        };
        let mut routes = RouteSet::new(gateway());

        let result = routes
            .redirect_default(&platform, Ipv4Addr::new(10, 8, 0, 2), "tun9")
            .await;
        assert!(matches!(result, Err(crate::Error::Route(_))));
        assert_eq!(routes.installed(), &[net("0.0.0.0/1")]);

        routes.teardown(&platform).await;
        let ops = platform.ops();
        assert_eq!(ops[ops.len() - 2], Op::Delete(net("0.0.0.0/1")));
        assert_eq!(
            ops[ops.len() - 1],
            Op::Add(net("0.0.0.0/0"), Ipv4Addr::new(192, 168, 1, 1), "eth0".into())
        );
    }

    #[tokio::test]
    async fn test_teardown_twice_is_noop() {
        let platform = RecordingPlatform::default();
        let mut routes = RouteSet::new(gateway());
        routes.teardown(&platform).await;
        routes.teardown(&platform).await;
        assert!(platform.ops().is_empty());
    }
}
