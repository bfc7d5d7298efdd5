//! The managed provider is a sibling reverse-proxy daemon with a device
//! credential provisioned at image-build time. This module reads that
//! credential from its environment file and probes the daemon's local health
//! port.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use log::debug;
use tokio::net::TcpStream;

/// Environment file the fleet provisioning drops on the device.
pub const TOKEN_ENV_FILE: &str = "/etc/default/distiller-tunnel";

/// Local health port of the managed tunnel daemon.
pub const HEALTH_PORT: u16 = 4040;

/// Bound for one health probe.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Fallback public suffix when the environment file does not name one.
const DEFAULT_DOMAIN: &str = "tunnel.pamir.ai";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedProvider {
    pub device_token: String,
    pub domain: String,
    pub health_addr: SocketAddr,
}

impl ManagedProvider {
    /// Parse the `KEY=VALUE` environment file. Returns `None` when the file
    /// is absent or carries no device token; the supervisor then goes
    /// straight to the ssh provider. `TUNNEL_HEALTH_PORT` moves the local
    /// health probe off the default port.
    pub fn from_env_file(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        let mut device_token = None;
        let mut domain = None;
        let mut health_port = None;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else { continue };
            let value = value.trim().trim_matches('"').to_owned();
            match key.trim() {
                "DEVICE_TOKEN" => device_token = Some(value),
                "TUNNEL_DOMAIN" => domain = Some(value),
                "TUNNEL_HEALTH_PORT" => health_port = value.parse::<u16>().ok(),
                _ => {},
            }
        }

        let device_token = device_token.filter(|t| !t.is_empty())?;
        Some(ManagedProvider {
            device_token,
            domain: domain.filter(|d| !d.is_empty()).unwrap_or_else(|| DEFAULT_DOMAIN.to_owned()),
            health_addr: SocketAddr::from(([127, 0, 0, 1], health_port.unwrap_or(HEALTH_PORT))),
        })
    }

    /// Public URL the managed daemon serves this device under.
    pub fn public_url(&self, hostname: &str) -> String {
        format!("https://{}.{}", hostname, self.domain)
    }

    /// One bounded probe of the local health indicator.
    pub async fn healthy(&self) -> bool {
        match tokio::time::timeout(HEALTH_TIMEOUT, TcpStream::connect(self.health_addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Managed tunnel health probe failed: {}", e);
                false
            },
            Err(_) => {
                debug!("Managed tunnel health probe timed out");
                false
            },
        }
    }
}
