//! # Generic types and traits for the network adapter
//!
//! The provisioning logic is polymorphic over this capability set; the
//! production implementation in [`nm`] talks to NetworkManager over the system
//! bus, tests use a scripted mock.

pub mod nm;

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::stream::BoxStream;

use crate::errors::ProvisionError;
use crate::state::WifiNetwork;

/// Wall-clock bound for a scan, including waiting for fresh results.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
/// Wall-clock bound for one station connection attempt.
pub const ACTIVATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Wall-clock bound for bringing the access point up.
pub const AP_START_TIMEOUT: Duration = Duration::from_secs(15);
/// Duplicate events inside this window are coalesced into one.
pub const EVENT_COALESCE_WINDOW: Duration = Duration::from_millis(500);
/// Wait before retrying a scan the daemon refused as busy.
pub const SCAN_BUSY_RETRY: Duration = Duration::from_secs(2);

/// Connectivity-relevant signals from the os network daemon, already coalesced
/// (duplicates within [`EVENT_COALESCE_WINDOW`] are dropped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    ConnectivityLost,
    ConnectivityRestored,
    DeviceDisconnected,
    ConnectionDeactivated,
    ActiveConnectionChanged(String),
}

/// Everything the provisioning logic needs from the os network daemon.
///
/// All writes are serialised by the implementation; `activate_profile` in
/// particular must never run concurrently with itself (the orchestrator's
/// connection lock guarantees callers do not try).
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    /// Scan for networks. Returns the raw list; callers usually pass it
    /// through [`dedupe_networks`]. Fails with `SCAN_BUSY` when the daemon
    /// reports a concurrent scan and `NO_DEVICE` without a wifi interface.
    async fn scan(&self) -> Result<Vec<WifiNetwork>, ProvisionError>;

    /// Names of saved station profiles (profile name == SSID).
    async fn list_profiles(&self) -> Result<Vec<String>, ProvisionError>;

    /// Create a station profile, or update the existing one of the same name.
    /// A `None` psk creates an open-network profile.
    async fn create_or_update_profile(
        &self,
        ssid: &str,
        psk: Option<&str>,
        hidden: bool,
    ) -> Result<(), ProvisionError>;

    async fn delete_profile(&self, name: &str) -> Result<(), ProvisionError>;

    /// Activate the named station profile and wait for the connection to
    /// settle, bounded by [`ACTIVATE_TIMEOUT`]. Failures are classified:
    /// `AUTH_FAIL` and `DHCP_FAIL` are terminal for the attempt,
    /// `ASSOC_FAIL` is retried once internally, a timeout surfaces as
    /// `CONNECT_TIMEOUT`.
    async fn activate_profile(&self, name: &str) -> Result<(), ProvisionError>;

    /// Deactivate any active wifi connection (station or AP).
    async fn deactivate_all_wifi(&self) -> Result<(), ProvisionError>;

    /// Bring up a WPA2-PSK access point with the given address, bounded by
    /// [`AP_START_TIMEOUT`]. The station profile must not be active afterwards.
    async fn start_ap(
        &self,
        ssid: &str,
        psk: &str,
        channel: u8,
        ipv4: Ipv4Addr,
    ) -> Result<(), ProvisionError>;

    /// Tear down the access point and its address configuration.
    async fn stop_ap(&self) -> Result<(), ProvisionError>;

    /// Current IPv4 of the primary (wifi) interface.
    async fn primary_ipv4(&self) -> Result<Option<Ipv4Addr>, ProvisionError>;

    /// SSID of the currently associated network, if any.
    async fn current_ssid(&self) -> Result<Option<String>, ProvisionError>;

    /// Signal level of the current association in dBm, if known.
    async fn signal_dbm(&self) -> Result<Option<i32>, ProvisionError>;

    /// Cheap connectivity probe used by the recovery path.
    async fn has_connectivity(&self) -> Result<bool, ProvisionError>;

    /// Lazy infinite stream of [`NetworkEvent`]s.
    async fn watch_events(&self) -> Result<BoxStream<'static, NetworkEvent>, ProvisionError>;
}

/// Deduplicate scan results for the user-facing list: hidden networks (empty
/// SSID) are discarded and only the strongest entry per SSID survives. The
/// result is sorted: in-use first, then by descending signal.
pub fn dedupe_networks(raw: Vec<WifiNetwork>) -> Vec<WifiNetwork> {
    let mut by_ssid: HashMap<String, WifiNetwork> = HashMap::new();
    for network in raw {
        if network.ssid.is_empty() {
            continue;
        }
        match by_ssid.get_mut(&network.ssid) {
            Some(existing) => {
                // `in_use` sticks even if a stronger duplicate replaces the entry
                let in_use = existing.in_use || network.in_use;
                if network.signal_percent > existing.signal_percent {
                    *existing = network;
                }
                existing.in_use = in_use;
            },
            None => {
                by_ssid.insert(network.ssid.clone(), network);
            },
        }
    }

    let mut networks: Vec<WifiNetwork> = by_ssid.into_values().collect();
    networks.sort_by(|a, b| {
        b.in_use
            .cmp(&a.in_use)
            .then(b.signal_percent.cmp(&a.signal_percent))
            .then(a.ssid.cmp(&b.ssid))
    });
    networks
}

/// Rough conversion from the daemon's percent scale to dBm.
pub fn percent_to_dbm(percent: u8) -> i32 {
    i32::from(percent.min(100)) / 2 - 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Security;

    fn net(ssid: &str, signal: u8, in_use: bool) -> WifiNetwork {
        WifiNetwork { ssid: ssid.to_owned(), signal_percent: signal, security: Security::Wpa2, in_use }
    }

    #[test]
    fn dedupe_keeps_strongest_per_ssid() {
        let result = dedupe_networks(vec![
            net("HomeNet", 40, false),
            net("HomeNet", 80, false),
            net("Other", 60, false),
            net("HomeNet", 10, false),
        ]);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].ssid, "HomeNet");
        assert_eq!(result[0].signal_percent, 80);
    }

    #[test]
    fn dedupe_discards_hidden_networks() {
        let result = dedupe_networks(vec![net("", 90, false), net("Visible", 10, false)]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].ssid, "Visible");
    }

    #[test]
    fn dedupe_preserves_in_use_across_duplicates() {
        let result = dedupe_networks(vec![net("HomeNet", 90, false), net("HomeNet", 30, true)]);
        assert_eq!(result.len(), 1);
        assert!(result[0].in_use);
        assert_eq!(result[0].signal_percent, 90);
    }

    #[test]
    fn in_use_sorts_first() {
        let result = dedupe_networks(vec![net("Strong", 99, false), net("Current", 20, true)]);
        assert_eq!(result[0].ssid, "Current");
    }

    #[test]
    fn percent_to_dbm_scale() {
        assert_eq!(percent_to_dbm(0), -100);
        assert_eq!(percent_to_dbm(100), -50);
        assert_eq!(percent_to_dbm(200), -50);
    }
}
