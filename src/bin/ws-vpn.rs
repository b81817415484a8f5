//! ws-vpn
//!
//! Runs either side of the tunnel, picked by `mode` in the config file:
//! - server: hands out addresses and relays packets between clients and its
//!   tunnel interface
//! - client: dials the server, brings up a tunnel interface and redirects
//!   the default route through it

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use ws_vpn::{
    client::VpnClient,
    config::{Config, Mode, Role},
    device::TunDevice,
    platform::SystemPlatform,
    server::VpnServer,
};

/// Lightweight IP-over-WebSocket VPN
#[derive(Parser, Debug)]
#[command(name = "ws-vpn")]
#[command(about = "Lightweight IP-over-WebSocket VPN")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Configuration file path (positional form)
    #[arg(value_name = "CONFIG", conflicts_with = "config")]
    config_path: Option<PathBuf>,

    /// Shorthand for --log-level debug
    #[arg(long)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error); overrides [logging]
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print a sample configuration for the given mode and exit
    #[arg(long, value_enum, value_name = "MODE")]
    example_config: Option<Mode>,
}

impl Args {
    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .or_else(|| self.config_path.clone())
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    fn log_filter(&self, config: Option<&Config>) -> String {
        if self.debug {
            return "debug".to_string();
        }
        self.log_level
            .clone()
            .or_else(|| config.map(|c| c.logging.level.clone()))
            .unwrap_or_else(|| "info".to_string())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(mode) = args.example_config {
        return match Config::example(mode).to_toml() {
            Ok(text) => {
                print!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    // The config may carry the log level, so read it before logging is up
    let path = args.config_path();
    let config = Config::load(&path);

    tracing_subscriber::fmt()
        .with_env_filter(args.log_filter(config.as_ref().ok()))
        .init();

    let outcome = match config {
        Ok(config) => {
            info!("ws-vpn v{} using {}", ws_vpn::VERSION, path.display());
            run(config).await
        }
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("Failed to load configuration from {}", path.display()))),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    match config.role().context("Invalid configuration")? {
        Role::Server(server_config) => {
            let server = VpnServer::new(server_config).context("Failed to create server")?;
            let listener = server.bind().await?;
            let tun_config = server.tun_config();
            let device =
                TunDevice::create(&tun_config).context("Failed to create tunnel interface")?;
            info!(
                "Tunnel interface {} up at {} (mtu {})",
                device.name(),
                tun_config.address,
                device.mtu()
            );

            server
                .run(listener, device, shutdown_signal())
                .await
                .context("Server stopped")?;
        }
        Role::Client(client_config) => {
            let client =
                VpnClient::new(client_config, SystemPlatform).context("Failed to create client")?;
            client
                .run(shutdown_signal())
                .await
                .context("Client stopped")?;
        }
    }

    info!("Goodbye");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
