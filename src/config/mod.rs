//! Configuration management

use crate::protocol::{PING_PERIOD, PONG_WAIT};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest MTU an IPv4 interface is required to carry
const MIN_MTU: u16 = 576;

/// Process role selected by the `mode` key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Which role this process plays
    pub mode: Mode,
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Validated role, ready to run
#[derive(Debug, Clone)]
pub enum Role {
    Server(ServerConfig),
    Client(ClientConfig),
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String, crate::Error> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Sample configuration for the given role
    pub fn example(mode: Mode) -> Self {
        match mode {
            Mode::Server => Self {
                mode,
                server: Some(ServerConfig::default()),
                client: None,
                logging: LoggingConfig::default(),
            },
            Mode::Client => Self {
                mode,
                server: None,
                client: Some(ClientConfig::default()),
                logging: LoggingConfig::default(),
            },
        }
    }

    /// Validate and pick the section matching `mode`
    pub fn role(&self) -> Result<Role, crate::Error> {
        match self.mode {
            Mode::Server => {
                let server = self.server.clone().ok_or_else(|| {
                    crate::Error::Config("mode is server but [server] is missing".into())
                })?;
                server.validate()?;
                Ok(Role::Server(server))
            }
            Mode::Client => {
                let client = self.client.clone().ok_or_else(|| {
                    crate::Error::Config("mode is client but [client] is missing".into())
                })?;
                client.validate()?;
                Ok(Role::Client(client))
            }
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen port
    pub port: u16,
    /// Listen address
    pub listen_addr: String,
    /// Server address and virtual subnet
    pub vpn_addr: Ipv4Net,
    /// Tunnel interface MTU
    pub mtu: u16,
    /// Tunnel interface name (OS picks one if unset)
    pub tun_name: Option<String>,
    /// TLS certificate path
    pub tls_cert: Option<PathBuf>,
    /// TLS key path
    pub tls_key: Option<PathBuf>,
    /// Per-connection outbound queue length
    pub outbound_queue: usize,
    /// Seconds a client may stay silent before it is dropped
    pub read_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            listen_addr: "0.0.0.0".to_string(),
            vpn_addr: Ipv4Net::new(std::net::Ipv4Addr::new(10, 8, 0, 1), 24)
                .unwrap_or_default(),
            mtu: 1400,
            tun_name: None,
            tls_cert: None,
            tls_key: None,
            outbound_queue: 256,
            read_timeout_secs: PONG_WAIT.as_secs(),
        }
    }
}

impl ServerConfig {
    /// `listen_addr:port`
    pub fn listen(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }

    /// Liveness window for inbound frames
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Both certificate and key, if TLS is configured
    pub fn tls(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), crate::Error> {
        check_port(self.port)?;
        check_mtu(self.mtu)?;
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(crate::Error::Config(
                "tls_cert and tls_key must be set together".into(),
            ));
        }
        if self.outbound_queue == 0 {
            return Err(crate::Error::Config("outbound_queue must be non-zero".into()));
        }
        if self.read_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "read_timeout_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or IPv4 address
    pub server: String,
    /// Server port
    pub port: u16,
    /// Tunnel interface MTU
    pub mtu: u16,
    /// Tunnel interface name (OS picks one if unset)
    pub tun_name: Option<String>,
    /// Dial `wss://` instead of `ws://`
    pub tls: bool,
    /// Extra trust anchor for the server certificate
    pub tls_ca: Option<PathBuf>,
    /// Send all traffic through the tunnel
    pub redirect_gateway: bool,
    /// Seconds between pings
    pub ping_interval_secs: u64,
    /// Seconds without a pong before the session is considered dead
    pub pong_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: 8080,
            mtu: 1400,
            tun_name: None,
            tls: false,
            tls_ca: None,
            redirect_gateway: true,
            ping_interval_secs: PING_PERIOD.as_secs(),
            pong_timeout_secs: PONG_WAIT.as_secs(),
        }
    }
}

impl ClientConfig {
    /// WebSocket URL of the server endpoint
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.server, self.port, crate::protocol::WS_PATH)
    }

    /// Period between keepalive pings
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// How long to wait for a pong before giving up on the server
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    fn validate(&self) -> Result<(), crate::Error> {
        if self.server.trim().is_empty() {
            return Err(crate::Error::Config("server must be set".into()));
        }
        check_port(self.port)?;
        check_mtu(self.mtu)?;
        if self.ping_interval_secs == 0 || self.ping_interval_secs >= self.pong_timeout_secs {
            return Err(crate::Error::Config(format!(
                "ping_interval_secs ({}) must be non-zero and shorter than pong_timeout_secs ({})",
                self.ping_interval_secs, self.pong_timeout_secs
            )));
        }
        if self.tls_ca.is_some() && !self.tls {
            return Err(crate::Error::Config("tls_ca is set but tls is off".into()));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn check_port(port: u16) -> Result<(), crate::Error> {
    if port == 0 {
        return Err(crate::Error::Config("port must be non-zero".into()));
    }
    Ok(())
}

fn check_mtu(mtu: u16) -> Result<(), crate::Error> {
    if mtu < MIN_MTU {
        return Err(crate::Error::Config(format!(
            "mtu {} is below the IPv4 minimum of {}",
            mtu, MIN_MTU
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_parses() {
        let config = Config::parse(
            r#"
            mode = "server"

            [server]
            port = 9000
            vpn_addr = "10.9.0.1/24"
            mtu = 1300
            "#,
        )
        .unwrap();

        match config.role().unwrap() {
            Role::Server(server) => {
                assert_eq!(server.listen(), "0.0.0.0:9000");
                assert_eq!(server.vpn_addr, "10.9.0.1/24".parse::<Ipv4Net>().unwrap());
                assert_eq!(server.mtu, 1300);
                assert_eq!(server.outbound_queue, 256);
                assert!(server.tls().is_none());
            }
            Role::Client(_) => panic!("expected server role"),
        }
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_client_config_parses() {
        let config = Config::parse(
            r#"
            mode = "client"

            [client]
            server = "203.0.113.7"
            port = 8443
            tls = true
            redirect_gateway = false
            "#,
        )
        .unwrap();

        let Role::Client(client) = config.role().unwrap() else {
            panic!("expected client role");
        };
        assert_eq!(client.url(), "wss://203.0.113.7:8443/ws");
        assert!(!client.redirect_gateway);
        assert_eq!(client.ping_interval(), PING_PERIOD);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result = Config::parse("mode = \"relay\"\n");
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_missing_section_rejected() {
        let config = Config::parse("mode = \"client\"\n").unwrap();
        assert!(matches!(config.role(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_validation_failures() {
        let mut server = ServerConfig::default();
        server.tls_cert = Some("cert.pem".into());
        assert!(server.validate().is_err());

        let mut server = ServerConfig::default();
        server.mtu = 100;
        assert!(server.validate().is_err());

        let mut client = ClientConfig::default();
        client.ping_interval_secs = 30;
        assert!(client.validate().is_err());

        let mut client = ClientConfig::default();
        client.port = 0;
        assert!(client.validate().is_err());
    }

    #[test]
    fn test_example_round_trips() {
        for mode in [Mode::Server, Mode::Client] {
            let text = Config::example(mode).to_toml().unwrap();
            let parsed = Config::parse(&text).unwrap();
            assert_eq!(parsed.mode, mode);
            assert!(parsed.role().is_ok());
        }
    }
}
