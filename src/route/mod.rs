//! System routing table access
//!
//! Shells out to `ip` on Linux and `route` on macOS. Adds are idempotent
//! (an existing route counts as success) and so are deletes of routes that
//! are already gone.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// The route traffic leaves through before the tunnel takes over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetGateway {
    /// Next hop of the default route
    pub gateway: Ipv4Addr,
    /// Interface of the default route
    pub device: String,
}

/// Look up the current IPv4 default route
pub async fn default_gateway() -> crate::Result<NetGateway> {
    #[cfg(target_os = "linux")]
    {
        let output = run("ip", &["-4", "route", "show", "default"]).await?;
        parse_linux_default_route(&output)
            .ok_or_else(|| crate::Error::Route(format!("no default route in: {}", output.trim())))
    }

    #[cfg(target_os = "macos")]
    {
        let output = run("route", &["-n", "get", "default"]).await?;
        parse_macos_default_route(&output)
            .ok_or_else(|| crate::Error::Route(format!("no default route in: {}", output.trim())))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(crate::Error::Route(
            "Route management not supported on this platform".into(),
        ))
    }
}

/// Add `dest` via `gateway` on `device`
pub async fn add_route(dest: Ipv4Net, gateway: Ipv4Addr, device: &str) -> crate::Result<()> {
    let (program, args) = add_command(dest, gateway, device);
    let output = execute(program, &args).await?;

    if output.status.success() {
        info!("Added route {} via {} dev {}", dest, gateway, device);
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_already_exists_error(&stderr) {
        warn!(
            "Route {} already exists (treating as success): {}",
            dest,
            stderr.trim()
        );
        Ok(())
    } else {
        Err(crate::Error::Route(format!(
            "Failed to add route {}: {}",
            dest,
            stderr.trim()
        )))
    }
}

/// Delete the route to `dest`
pub async fn delete_route(dest: Ipv4Net) -> crate::Result<()> {
    let (program, args) = delete_command(dest);
    let output = execute(program, &args).await?;

    if output.status.success() {
        info!("Removed route {}", dest);
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_missing_route_error(&stderr) {
        debug!("Route {} already gone: {}", dest, stderr.trim());
        Ok(())
    } else {
        Err(crate::Error::Route(format!(
            "Failed to remove route {}: {}",
            dest,
            stderr.trim()
        )))
    }
}

fn add_command(dest: Ipv4Net, gateway: Ipv4Addr, device: &str) -> (&'static str, Vec<String>) {
    if cfg!(target_os = "macos") {
        ("route", macos_add_args(dest, gateway))
    } else {
        ("ip", linux_add_args(dest, gateway, device))
    }
}

fn delete_command(dest: Ipv4Net) -> (&'static str, Vec<String>) {
    if cfg!(target_os = "macos") {
        ("route", macos_delete_args(dest))
    } else {
        ("ip", linux_delete_args(dest))
    }
}

fn linux_add_args(dest: Ipv4Net, gateway: Ipv4Addr, device: &str) -> Vec<String> {
    vec![
        "route".into(),
        "add".into(),
        dest.to_string(),
        "via".into(),
        gateway.to_string(),
        "dev".into(),
        device.into(),
    ]
}

fn linux_delete_args(dest: Ipv4Net) -> Vec<String> {
    vec!["route".into(), "del".into(), dest.to_string()]
}

fn macos_add_args(dest: Ipv4Net, gateway: Ipv4Addr) -> Vec<String> {
    vec![
        "-n".into(),
        "add".into(),
        "-net".into(),
        dest.to_string(),
        gateway.to_string(),
    ]
}

fn macos_delete_args(dest: Ipv4Net) -> Vec<String> {
    vec![
        "-n".into(),
        "delete".into(),
        "-net".into(),
        dest.to_string(),
    ]
}

async fn execute(program: &str, args: &[String]) -> crate::Result<std::process::Output> {
    debug!("{} {}", program, args.join(" "));
    Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| crate::Error::Route(format!("Failed to execute {}: {}", program, e)))
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
async fn run(program: &str, args: &[&str]) -> crate::Result<String> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let output = execute(program, &args).await?;
    if !output.status.success() {
        return Err(crate::Error::Route(format!(
            "{} failed: {}",
            program,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `ip -4 route show default`:
/// `default via 192.168.1.1 dev eth0 proto dhcp metric 100`
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_linux_default_route(output: &str) -> Option<NetGateway> {
    output.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"default") {
            return None;
        }
        let value_after = |key: &str| {
            tokens
                .windows(2)
                .find(|pair| pair[0] == key)
                .map(|pair| pair[1])
        };
        Some(NetGateway {
            gateway: value_after("via")?.parse().ok()?,
            device: value_after("dev")?.to_string(),
        })
    })
}

/// Parse `route -n get default`:
/// ```text
///    route to: default
///     gateway: 192.168.1.1
///   interface: en0
/// ```
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_macos_default_route(output: &str) -> Option<NetGateway> {
    let mut gateway = None;
    let mut device = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("gateway:") {
            gateway = rest.trim().parse().ok();
        }
        if let Some(rest) = line.strip_prefix("interface:") {
            device = Some(rest.trim().to_string());
        }
    }

    Some(NetGateway {
        gateway: gateway?,
        device: device?,
    })
}

/// Linux: "RTNETLINK answers: File exists"; macOS: "route: ... File exists"
fn is_already_exists_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("file exists") || lower.contains("eexist")
}

/// Linux: "RTNETLINK answers: No such process"; macOS: "not in table"
fn is_missing_route_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such process") || lower.contains("not in table")
}
