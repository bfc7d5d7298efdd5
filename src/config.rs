//! The service configuration is defined in this module. Every knob is an
//! environment variable with the `APP_` prefix and has a command line spelling
//! as well; invalid values abort startup.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;

use crate::errors::ProvisionError;

/// Which tunnel provider to try first when the device comes online.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelProviderKind {
    Managed,
    Ssh,
}

impl FromStr for TunnelProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "managed" => Ok(TunnelProviderKind::Managed),
            "ssh" => Ok(TunnelProviderKind::Ssh),
            other => Err(format!("expected 'managed' or 'ssh', got '{}'", other)),
        }
    }
}

#[derive(StructOpt, Debug, Clone)]
pub struct Config {
    /// Literal prefix for the setup access point SSID
    #[structopt(long = "ap-ssid-prefix", default_value = "Distiller", env = "APP_AP_SSID_PREFIX")]
    pub ap_ssid_prefix: String,

    /// IPv4 address assigned to the access point interface
    #[structopt(long = "ap-ip", default_value = "192.168.4.1", env = "APP_AP_IP")]
    pub ap_ip: Ipv4Addr,

    /// 2.4 GHz channel for the access point (1-11)
    #[structopt(long = "ap-channel", default_value = "6", env = "APP_AP_CHANNEL")]
    pub ap_channel: u8,

    /// Bind address of the web server
    #[structopt(long = "web-host", default_value = "0.0.0.0", env = "APP_WEB_HOST")]
    pub web_host: Ipv4Addr,

    /// Listening port of the web server
    #[structopt(long = "web-port", default_value = "8080", env = "APP_WEB_PORT")]
    pub web_port: u16,

    /// Directory for the state and identity files
    #[structopt(
        parse(from_os_str),
        long = "state-dir",
        default_value = "/var/lib/wifi-provision",
        env = "APP_STATE_DIR"
    )]
    pub state_dir: PathBuf,

    /// Wildcard DNS + http redirect while the access point is up
    #[structopt(
        long = "enable-captive-portal",
        default_value = "true",
        env = "APP_ENABLE_CAPTIVE_PORTAL",
        parse(try_from_str)
    )]
    pub enable_captive_portal: bool,

    /// Remote-access tunnel while connected
    #[structopt(
        long = "tunnel-enabled",
        default_value = "true",
        env = "APP_TUNNEL_ENABLED",
        parse(try_from_str)
    )]
    pub tunnel_enabled: bool,

    /// Tunnel provider tried first: 'managed' or 'ssh'
    #[structopt(
        long = "tunnel-provider-primary",
        default_value = "managed",
        env = "APP_TUNNEL_PROVIDER_PRIMARY"
    )]
    pub tunnel_provider_primary: TunnelProviderKind,

    /// SSH relay host for the fallback tunnel
    #[structopt(long = "tunnel-ssh-host", default_value = "a.pinggy.io", env = "APP_TUNNEL_SSH_HOST")]
    pub tunnel_ssh_host: String,

    /// SSH relay port for the fallback tunnel
    #[structopt(long = "tunnel-ssh-port", default_value = "443", env = "APP_TUNNEL_SSH_PORT")]
    pub tunnel_ssh_port: u16,

    /// Access token extending the ssh tunnel lifetime, if any
    #[structopt(long = "tunnel-access-token", default_value = "", env = "APP_TUNNEL_ACCESS_TOKEN")]
    pub tunnel_access_token: String,

    /// Seconds between tunnel refreshes (should stay below the tunnel lifetime)
    #[structopt(
        long = "tunnel-refresh-interval-s",
        default_value = "3300",
        env = "APP_TUNNEL_REFRESH_INTERVAL_S"
    )]
    pub tunnel_refresh_interval_s: u64,

    /// Verbose logging
    #[structopt(long, default_value = "false", env = "APP_DEBUG", parse(try_from_str))]
    pub debug: bool,
}

impl Config {
    /// Range checks that the type system cannot express. Called once at boot;
    /// a failure here is a configuration error (exit code 2).
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if !(1..=11).contains(&self.ap_channel) {
            return Err(ProvisionError::Generic(format!(
                "AP_CHANNEL must be a 2.4 GHz channel between 1 and 11, got {}",
                self.ap_channel
            )));
        }
        if self.tunnel_refresh_interval_s == 0 {
            return Err(ProvisionError::Generic(
                "TUNNEL_REFRESH_INTERVAL_S must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Path of the persisted system state snapshot.
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    /// Path of the persisted device identity.
    pub fn identity_file(&self) -> PathBuf {
        self.state_dir.join("device.json")
    }
}

#[cfg(test)]
impl Default for Config {
    /// Test fixture with the documented defaults and a relative state dir.
    fn default() -> Self {
        Config {
            ap_ssid_prefix: "Distiller".to_owned(),
            ap_ip: Ipv4Addr::new(192, 168, 4, 1),
            ap_channel: 6,
            web_host: Ipv4Addr::new(0, 0, 0, 0),
            web_port: 8080,
            state_dir: PathBuf::from("state"),
            enable_captive_portal: true,
            tunnel_enabled: true,
            tunnel_provider_primary: TunnelProviderKind::Managed,
            tunnel_ssh_host: "a.pinggy.io".to_owned(),
            tunnel_ssh_port: 443,
            tunnel_access_token: String::new(),
            tunnel_refresh_interval_s: 3300,
            debug: false,
        }
    }
}
