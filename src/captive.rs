//! # Captive portal controller
//!
//! Two side effects scoped to AP mode: a wildcard-DNS drop-in for the network
//! daemon's dnsmasq helper, and a NAT redirect of port 80 towards the local
//! web server. Acquisition is scoped: a failure during entry undoes whatever
//! was already applied. Entry always purges leftovers first, so re-entry after
//! an abnormal AP teardown is idempotent.
//!
//! Rule manipulation goes through the [`CommandRunner`] seam; production uses
//! [`SystemCommandRunner`], tests model the nat table behind a fake.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;

use crate::errors::ProvisionError;

/// Drop-in directory of NetworkManager's dnsmasq instance in shared mode.
pub const DNSMASQ_DROPIN_DIR: &str = "/etc/NetworkManager/dnsmasq-shared.d";
const DNS_CONF_NAME: &str = "90-wifi-provision.conf";

/// NAT chain owned by this service. Created on entry, purged on every entry
/// and exit.
const NAT_CHAIN: &str = "WIFI_PROVISION";

/// Executes external commands with argv arrays. The seam exists so tests can
/// model the firewall instead of shelling out.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`; `Ok` on exit status zero.
    async fn run(&self, program: &str, args: &[String]) -> Result<(), String>;
}

/// Shells out via the process API. String concatenation never reaches a
/// shell here.
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<(), String> {
        let status = Command::new(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| e.to_string())?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("{} exited with {}", program, status))
        }
    }
}

pub struct CaptivePortal {
    interface: String,
    ap_ip: Ipv4Addr,
    web_port: u16,
    dns_conf: PathBuf,
    /// Used to ask the daemon to reload DNS config; absent in tests.
    bus: Option<zbus::Connection>,
    runner: Arc<dyn CommandRunner>,
}

impl CaptivePortal {
    pub fn new(
        interface: String,
        ap_ip: Ipv4Addr,
        web_port: u16,
        dropin_dir: PathBuf,
        bus: Option<zbus::Connection>,
    ) -> Self {
        CaptivePortal {
            interface,
            ap_ip,
            web_port,
            dns_conf: dropin_dir.join(DNS_CONF_NAME),
            bus,
            runner: Arc::new(SystemCommandRunner),
        }
    }

    /// Replace the command runner. Tests model the firewall through this.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Apply both side effects. Partial state is rolled back before the error
    /// surfaces as `CAPTIVE_FAIL`.
    pub async fn enter(&self) -> Result<(), ProvisionError> {
        // Stale rules from a crashed run must not stack up.
        self.purge_nat_rules().await;

        if let Err(e) = self.write_dns_config().await {
            return Err(ProvisionError::CaptiveFailed(format!("dns config: {}", e)));
        }
        self.reload_daemon_dns().await;

        if let Err(e) = self.install_nat_rules().await {
            // scoped acquisition: undo the DNS half before surfacing
            self.remove_dns_config().await;
            self.reload_daemon_dns().await;
            self.purge_nat_rules().await;
            return Err(ProvisionError::CaptiveFailed(e));
        }

        info!(
            "Captive portal active on {} ({} -> port {})",
            self.interface, self.ap_ip, self.web_port
        );
        Ok(())
    }

    /// Release both side effects. Safe to call when nothing is applied.
    pub async fn exit(&self) {
        self.remove_dns_config().await;
        self.reload_daemon_dns().await;
        self.purge_nat_rules().await;
        info!("Captive portal released on {}", self.interface);
    }

    /// The drop-in resolves every A query on the AP interface to the AP
    /// address.
    fn dns_config_contents(&self) -> String {
        format!(
            "# Generated by wifi-provision; removed when the setup AP stops.\n\
             interface={}\n\
             address=/#/{}\n",
            self.interface, self.ap_ip
        )
    }

    async fn write_dns_config(&self) -> std::io::Result<()> {
        if let Some(parent) = self.dns_conf.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.dns_conf, self.dns_config_contents()).await
    }

    async fn remove_dns_config(&self) {
        match tokio::fs::remove_file(&self.dns_conf).await {
            Ok(()) => debug!("Removed {}", self.dns_conf.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!("Failed to remove {}: {}", self.dns_conf.display(), e),
        }
    }

    async fn reload_daemon_dns(&self) {
        if let Some(bus) = &self.bus {
            if let Err(e) = crate::network::nm::reload_dns(bus).await {
                warn!("DNS reload request failed: {}", e);
            }
        }
    }

    fn dnat_rule(&self) -> Vec<String> {
        vec![
            "-i".to_owned(),
            self.interface.clone(),
            "-p".to_owned(),
            "tcp".to_owned(),
            "--dport".to_owned(),
            "80".to_owned(),
            "-j".to_owned(),
            "DNAT".to_owned(),
            "--to-destination".to_owned(),
            format!("{}:{}", self.ap_ip, self.web_port),
        ]
    }

    async fn install_nat_rules(&self) -> Result<(), String> {
        self.iptables(owned(&["-t", "nat", "-N", NAT_CHAIN]))
            .await
            .map_err(|e| format!("create chain: {}", e))?;

        let mut rule = owned(&["-t", "nat", "-A", NAT_CHAIN]);
        rule.extend(self.dnat_rule());
        self.iptables(rule).await.map_err(|e| format!("redirect rule: {}", e))?;

        self.iptables(owned(&["-t", "nat", "-I", "PREROUTING", "-j", NAT_CHAIN]))
            .await
            .map_err(|e| format!("hook chain: {}", e))?;
        Ok(())
    }

    /// Remove every reference to our chain, then the chain itself. Each step
    /// tolerates absence, so this doubles as the idempotent pre-entry purge.
    async fn purge_nat_rules(&self) {
        // References can stack if a previous run crashed between insert and purge.
        loop {
            if self
                .iptables(owned(&["-t", "nat", "-D", "PREROUTING", "-j", NAT_CHAIN]))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = self.iptables(owned(&["-t", "nat", "-F", NAT_CHAIN])).await;
        let _ = self.iptables(owned(&["-t", "nat", "-X", NAT_CHAIN])).await;
    }

    async fn iptables(&self, args: Vec<String>) -> Result<(), String> {
        debug!("iptables {}", args.join(" "));
        self.runner.run("iptables", &args).await
    }
}

fn owned(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| (*part).to_owned()).collect()
}
