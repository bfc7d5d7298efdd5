//! # Device identity
//!
//! Every device derives a stable four-hex-character id from the MAC address of
//! its primary interface. The id feeds the hostname and the setup access point
//! SSID and is persisted on first boot; afterwards the file is authoritative
//! even if interfaces change.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::errors::ProvisionError;

/// Interface name prefixes that never identify the device.
const VIRTUAL_PREFIXES: &[&str] = &["lo", "br-", "veth", "virbr", "docker"];

/// Wired interfaces are preferred over wireless; anything else comes last.
const WIRED_PREFIXES: &[&str] = &["eth", "en"];
const WIRELESS_PREFIXES: &[&str] = &["wlan", "wl"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Four lowercase hex chars taken from the MAC's last four nibbles
    pub device_id: String,
    /// `{prefix}-{device_id}`, all lowercase
    pub hostname: String,
    /// `{Prefix}-{DEVICE_ID}`: prefix capitalised, id uppercase
    pub ap_ssid: String,
    pub created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Load the persisted identity, or derive one from the primary MAC and
    /// persist it. Fails with `NO_MAC` when no suitable interface exists;
    /// the caller treats that as fatal.
    pub fn load_or_generate(path: &Path, ssid_prefix: &str) -> Result<Self, ProvisionError> {
        if let Ok(raw) = fs::read_to_string(path) {
            let identity: DeviceIdentity = serde_json::from_str(&raw)?;
            debug!("Loaded device identity {} from {}", identity.device_id, path.display());
            return Ok(identity);
        }

        let mac = primary_mac(Path::new("/sys/class/net"))?;
        let identity = Self::from_mac(&mac, ssid_prefix)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ProvisionError::IO(e, "create state dir"))?;
        }
        fs::write(path, serde_json::to_vec_pretty(&identity)?)
            .map_err(|e| ProvisionError::IO(e, "persist device identity"))?;
        info!("Generated device identity {} from MAC {}", identity.device_id, mac);
        Ok(identity)
    }

    /// Derive the identity fields from a MAC address string (`aa:bb:cc:dd:ee:ff`).
    pub fn from_mac(mac: &str, ssid_prefix: &str) -> Result<Self, ProvisionError> {
        let nibbles: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        if nibbles.len() < 4 {
            return Err(ProvisionError::NoMacAddress);
        }
        let device_id = nibbles[nibbles.len() - 4..].to_ascii_lowercase();

        Ok(DeviceIdentity {
            hostname: format!("{}-{}", ssid_prefix.to_ascii_lowercase(), device_id),
            ap_ssid: format!("{}-{}", capitalise(ssid_prefix), device_id.to_ascii_uppercase()),
            device_id,
            created_at: Utc::now(),
        })
    }
}

fn capitalise(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn is_virtual(name: &str) -> bool {
    VIRTUAL_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

fn priority(name: &str) -> u8 {
    if WIRED_PREFIXES.iter().any(|p| name.starts_with(p)) {
        0
    } else if WIRELESS_PREFIXES.iter().any(|p| name.starts_with(p)) {
        1
    } else {
        2
    }
}

/// Walk the sysfs network class and return the MAC of the best physical
/// interface: wired first, wireless second, then any remaining non-virtual
/// interface. All-zero MACs are skipped.
fn primary_mac(sysfs_net: &Path) -> Result<String, ProvisionError> {
    let entries = fs::read_dir(sysfs_net).map_err(|e| ProvisionError::IO(e, "read /sys/class/net"))?;

    let mut candidates: Vec<(u8, String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            if is_virtual(&name) {
                return None;
            }
            Some((priority(&name), name, entry.path()))
        })
        .collect();
    candidates.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

    for (_, name, path) in candidates {
        let address = match fs::read_to_string(path.join("address")) {
            Ok(raw) => raw.trim().to_owned(),
            Err(_) => continue,
        };
        if address.is_empty() || address == "00:00:00:00:00:00" {
            continue;
        }
        debug!("Using MAC of interface {}: {}", name, address);
        return Ok(address);
    }

    Err(ProvisionError::NoMacAddress)
}
