//! NetworkManager adapter via the system D-Bus.
//!
//! All writes funnel through one internal lock, so the daemon never sees two
//! competing profile operations from this service. Failure classification
//! follows the device state-change reasons the daemon reports during an
//! attempt.

mod events;
mod proxies;
mod settings;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use log::{debug, info, warn};
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

use super::{percent_to_dbm, NetworkAdapter, NetworkEvent, ACTIVATE_TIMEOUT, AP_START_TIMEOUT, SCAN_TIMEOUT};
use crate::errors::{ErrorCode, ProvisionError};
use crate::state::{Security, WifiNetwork};
use proxies::*;
use settings::AP_PROFILE_UUID;

/// Polling cadence while waiting for scan results or AP activation.
const POLL_INTERVAL: Duration = Duration::from_millis(400);

pub struct NetworkManagerAdapter {
    connection: zbus::Connection,
    device_path: OwnedObjectPath,
    interface_name: String,
    /// Serialises every write towards the daemon
    write_lock: tokio::sync::Mutex<()>,
}

impl NetworkManagerAdapter {
    /// Connect to the system bus, make sure networking and wireless are
    /// enabled and locate the wifi device. Fails with `NO_DEVICE` when the
    /// system has none; the caller treats that as fatal.
    pub async fn new() -> Result<Self, ProvisionError> {
        let connection = zbus::Connection::system().await?;

        let nm = NetworkManagerProxy::new(&connection).await?;
        if !nm.networking_enabled().await.unwrap_or(true) {
            nm.enable(true).await?;
        }
        if !nm.wireless_enabled().await.unwrap_or(true) {
            nm.set_wireless_enabled(true).await?;
        }

        let (device_path, interface_name) = find_wifi_device(&connection).await?;
        info!("Using wifi device {} at {}", interface_name, device_path);

        Ok(NetworkManagerAdapter {
            connection,
            device_path,
            interface_name,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    /// The underlying bus connection, shared with the captive portal
    /// controller for DNS reload requests.
    pub fn bus(&self) -> &zbus::Connection {
        &self.connection
    }

    async fn nm(&self) -> zbus::Result<NetworkManagerProxy<'_>> {
        NetworkManagerProxy::new(&self.connection).await
    }

    async fn device(&self) -> zbus::Result<DeviceProxy<'_>> {
        DeviceProxy::builder(&self.connection).path(&self.device_path)?.build().await
    }

    async fn wireless(&self) -> zbus::Result<WirelessDeviceProxy<'_>> {
        WirelessDeviceProxy::builder(&self.connection).path(&self.device_path)?.build().await
    }

    async fn settings(&self) -> zbus::Result<SettingsProxy<'_>> {
        SettingsProxy::new(&self.connection).await
    }

    /// Map one daemon access point object to the scan result shape.
    async fn access_point(
        &self,
        path: &OwnedObjectPath,
        active: Option<&OwnedObjectPath>,
    ) -> Result<WifiNetwork, ProvisionError> {
        let ap = AccessPointProxy::builder(&self.connection).path(path)?.build().await?;
        let ssid = String::from_utf8(ap.ssid().await?).unwrap_or_default();
        let flags = ap.flags().await.unwrap_or(0);
        let wpa = ap.wpa_flags().await.unwrap_or(0);
        let rsn = ap.rsn_flags().await.unwrap_or(0);

        Ok(WifiNetwork {
            ssid,
            signal_percent: ap.strength().await.unwrap_or(0),
            security: classify_security(flags, wpa, rsn),
            in_use: active.map(|a| a == path).unwrap_or(false),
        })
    }

    /// Find a station profile by name. Profiles whose backing keyfile fails
    /// the ownership/permission check are deleted on sight and reported as
    /// absent; the caller then recreates them.
    async fn find_trusted_profile(
        &self,
        name: &str,
    ) -> Result<Option<OwnedObjectPath>, ProvisionError> {
        for path in self.settings().await?.list_connections().await? {
            let proxy =
                SettingsConnectionProxy::builder(&self.connection).path(&path)?.build().await?;
            let profile = match profile_of(&proxy).await {
                Some(profile) => profile,
                None => continue,
            };
            if profile.id != name || profile.is_ap {
                continue;
            }

            if let Ok(filename) = proxy.filename().await {
                if !filename.is_empty() && !keyfile_is_trusted(&filename).await {
                    warn!("Profile '{}' has untrusted keyfile {}; deleting", name, filename);
                    proxy.delete().await?;
                    return Ok(None);
                }
            }
            return Ok(Some(path));
        }
        Ok(None)
    }

    /// Delete any AP profile left over from this or a previous run.
    async fn remove_ap_profile(&self) -> Result<(), ProvisionError> {
        let settings = self.settings().await?;
        if let Ok(path) = settings.get_connection_by_uuid(AP_PROFILE_UUID).await {
            debug!("Deleting stale AP profile at {}", path);
            let proxy =
                SettingsConnectionProxy::builder(&self.connection).path(&path)?.build().await?;
            let _ = proxy.delete().await;
        }
        Ok(())
    }

    /// One activation attempt, bounded by [`ACTIVATE_TIMEOUT`]. The device
    /// state-change stream is subscribed before the activation call so no
    /// transition is missed.
    async fn activate_once(&self, profile: &OwnedObjectPath) -> Result<(), ProvisionError> {
        let device = self.device().await?;
        let mut state_changes = device.receive_device_state_changed().await?;

        let nm = self.nm().await?;
        let active = nm
            .activate_connection(
                profile.as_ref(),
                self.device_path.as_ref(),
                ObjectPath::from_static_str_unchecked("/"),
            )
            .await?;

        let wait = tokio::time::timeout(ACTIVATE_TIMEOUT, async {
            if DeviceState::from(device.state().await.unwrap_or(0)) == DeviceState::Activated {
                return Ok(());
            }
            while let Some(signal) = state_changes.next().await {
                let args = match signal.args() {
                    Ok(args) => args,
                    Err(_) => continue,
                };
                match DeviceState::from(args.new_state) {
                    DeviceState::Activated => return Ok(()),
                    DeviceState::Failed => return Err(classify_failure(args.reason)),
                    _ => {},
                }
            }
            Err(ProvisionError::Connect(
                ErrorCode::ConnectTimeout,
                "device state stream ended".to_owned(),
            ))
        })
        .await;

        match wait {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                let _ = nm.deactivate_connection(active.as_ref()).await;
                Err(e)
            },
            Err(_) => {
                // pending work is cancelled; the daemon must not keep trying
                let _ = nm.deactivate_connection(active.as_ref()).await;
                Err(ProvisionError::Connect(
                    ErrorCode::ConnectTimeout,
                    format!("no activation within {}s", ACTIVATE_TIMEOUT.as_secs()),
                ))
            },
        }
    }
}

#[async_trait]
impl NetworkAdapter for NetworkManagerAdapter {
    async fn scan(&self) -> Result<Vec<WifiNetwork>, ProvisionError> {
        let wireless = self.wireless().await?;
        let before = wireless.last_scan().await.unwrap_or(-1);

        if let Err(e) = wireless.request_scan(HashMap::new()).await {
            if scan_refused(&e) {
                return Err(ProvisionError::ScanBusy);
            }
            return Err(e.into());
        }

        // Wait for the daemon to report a fresh scan; serve whatever exists
        // once the scan timeout elapses.
        let deadline = Instant::now() + SCAN_TIMEOUT;
        while Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            if wireless.last_scan().await.unwrap_or(-1) != before {
                break;
            }
        }

        let active = wireless.active_access_point().await.ok().filter(|p| p.len() > 1);
        let mut networks = Vec::new();
        for path in wireless.access_points().await? {
            match self.access_point(&path, active.as_ref()).await {
                Ok(network) => networks.push(network),
                Err(e) => debug!("Skipping access point {}: {}", path, e),
            }
        }
        Ok(networks)
    }

    async fn list_profiles(&self) -> Result<Vec<String>, ProvisionError> {
        let mut names = Vec::new();
        for path in self.settings().await?.list_connections().await? {
            let proxy =
                SettingsConnectionProxy::builder(&self.connection).path(&path)?.build().await?;
            if let Some(profile) = profile_of(&proxy).await {
                if !profile.is_ap {
                    names.push(profile.id);
                }
            }
        }
        Ok(names)
    }

    async fn create_or_update_profile(
        &self,
        ssid: &str,
        psk: Option<&str>,
        hidden: bool,
    ) -> Result<(), ProvisionError> {
        let _guard = self.write_lock.lock().await;
        let profile = settings::station_profile(ssid, psk, hidden);

        match self.find_trusted_profile(ssid).await? {
            Some(path) => {
                debug!("Updating existing profile for '{}'", ssid);
                let proxy =
                    SettingsConnectionProxy::builder(&self.connection).path(&path)?.build().await?;
                proxy.update(profile).await?;
            },
            None => {
                debug!("Creating profile for '{}'", ssid);
                self.settings().await?.add_connection(profile).await?;
            },
        }
        Ok(())
    }

    async fn delete_profile(&self, name: &str) -> Result<(), ProvisionError> {
        let _guard = self.write_lock.lock().await;
        for path in self.settings().await?.list_connections().await? {
            let proxy =
                SettingsConnectionProxy::builder(&self.connection).path(&path)?.build().await?;
            if let Some(profile) = profile_of(&proxy).await {
                if profile.id == name && !profile.is_ap {
                    proxy.delete().await?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn activate_profile(&self, name: &str) -> Result<(), ProvisionError> {
        let _guard = self.write_lock.lock().await;
        let profile = self.find_trusted_profile(name).await?.ok_or_else(|| {
            ProvisionError::Generic(format!("no saved profile named '{}'", name))
        })?;

        match self.activate_once(&profile).await {
            // association failures get one internal retry
            Err(ProvisionError::Connect(ErrorCode::AssocFail, message)) => {
                warn!("Association with '{}' rejected ({}); retrying once", name, message);
                self.activate_once(&profile).await
            },
            other => other,
        }
    }

    async fn deactivate_all_wifi(&self) -> Result<(), ProvisionError> {
        let _guard = self.write_lock.lock().await;
        let device = self.device().await?;
        if let Err(e) = device.disconnect().await {
            // disconnecting an already-idle device is not an error
            debug!("Device disconnect: {}", e);
        }
        Ok(())
    }

    async fn start_ap(
        &self,
        ssid: &str,
        psk: &str,
        channel: u8,
        ipv4: Ipv4Addr,
    ) -> Result<(), ProvisionError> {
        let _guard = self.write_lock.lock().await;
        self.remove_ap_profile().await?;

        info!("Configuring access point '{}' on {}", ssid, self.interface_name);
        let profile_map = settings::ap_profile(ssid, psk, channel, ipv4, &self.interface_name);
        let profile = self
            .settings()
            .await?
            .add_connection(profile_map)
            .await
            .map_err(|e| ProvisionError::ApStartFailed(e.to_string()))?;

        let nm = self.nm().await?;
        let active = match nm
            .activate_connection(
                profile.as_ref(),
                self.device_path.as_ref(),
                ObjectPath::from_static_str_unchecked("/"),
            )
            .await
        {
            Ok(active) => active,
            Err(e) => {
                let _ = self.remove_ap_profile().await;
                return Err(ProvisionError::ApStartFailed(e.to_string()));
            },
        };

        let active_proxy =
            ActiveConnectionProxy::builder(&self.connection).path(&active)?.build().await?;
        let deadline = Instant::now() + AP_START_TIMEOUT;
        loop {
            match ActiveState::from(active_proxy.state().await.unwrap_or(0)) {
                ActiveState::Activated => break,
                ActiveState::Deactivated | ActiveState::Deactivating => {
                    let _ = self.remove_ap_profile().await;
                    return Err(ProvisionError::ApStartFailed(
                        "access point connection deactivated".to_owned(),
                    ));
                },
                _ if Instant::now() >= deadline => {
                    let _ = nm.deactivate_connection(active.as_ref()).await;
                    let _ = self.remove_ap_profile().await;
                    return Err(ProvisionError::ApStartFailed(format!(
                        "not active within {}s",
                        AP_START_TIMEOUT.as_secs()
                    )));
                },
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }

        info!("Access point '{}' active at {}", ssid, ipv4);
        Ok(())
    }

    async fn stop_ap(&self) -> Result<(), ProvisionError> {
        let _guard = self.write_lock.lock().await;
        let nm = self.nm().await?;
        for path in nm.active_connections().await.unwrap_or_default() {
            let proxy = match ActiveConnectionProxy::builder(&self.connection).path(&path) {
                Ok(builder) => match builder.build().await {
                    Ok(proxy) => proxy,
                    Err(_) => continue,
                },
                Err(_) => continue,
            };
            if matches!(proxy.uuid().await.as_deref(), Ok(AP_PROFILE_UUID)) {
                debug!("Deactivating access point connection {}", path);
                let _ = nm.deactivate_connection(path.as_ref()).await;
            }
        }
        self.remove_ap_profile().await
    }

    async fn primary_ipv4(&self) -> Result<Option<Ipv4Addr>, ProvisionError> {
        let device = self.device().await?;
        let config_path = match device.ip4_config().await {
            Ok(path) if path.len() > 1 => path,
            _ => return Ok(None),
        };
        let config =
            Ip4ConfigProxy::builder(&self.connection).path(&config_path)?.build().await?;
        for address in config.address_data().await.unwrap_or_default() {
            if let Some(value) = address.get("address") {
                if let Value::Str(s) = &**value {
                    if let Ok(parsed) = s.as_str().parse::<Ipv4Addr>() {
                        return Ok(Some(parsed));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn current_ssid(&self) -> Result<Option<String>, ProvisionError> {
        let wireless = self.wireless().await?;
        let active = match wireless.active_access_point().await {
            Ok(path) if path.len() > 1 => path,
            _ => return Ok(None),
        };
        let ap = AccessPointProxy::builder(&self.connection).path(&active)?.build().await?;
        Ok(Some(String::from_utf8(ap.ssid().await?)?))
    }

    async fn signal_dbm(&self) -> Result<Option<i32>, ProvisionError> {
        let wireless = self.wireless().await?;
        let active = match wireless.active_access_point().await {
            Ok(path) if path.len() > 1 => path,
            _ => return Ok(None),
        };
        let ap = AccessPointProxy::builder(&self.connection).path(&active)?.build().await?;
        Ok(Some(percent_to_dbm(ap.strength().await?)))
    }

    async fn has_connectivity(&self) -> Result<bool, ProvisionError> {
        // 3 = limited, 4 = full; local reachability is enough here
        Ok(self.nm().await?.check_connectivity().await? >= 3)
    }

    async fn watch_events(&self) -> Result<BoxStream<'static, NetworkEvent>, ProvisionError> {
        events::event_stream(self.connection.clone(), self.device_path.clone()).await
    }
}

/// Ask the daemon to re-read its DNS configuration, dnsmasq drop-ins
/// included. Used by the captive portal controller.
pub async fn reload_dns(connection: &zbus::Connection) -> Result<(), ProvisionError> {
    let nm = NetworkManagerProxy::new(connection).await?;
    nm.reload(NM_RELOAD_DNS).await?;
    Ok(())
}

/// Locate the first wifi device the daemon manages.
async fn find_wifi_device(
    connection: &zbus::Connection,
) -> Result<(OwnedObjectPath, String), ProvisionError> {
    let nm = NetworkManagerProxy::new(connection).await?;
    for path in nm.get_devices().await? {
        let device = match DeviceProxy::builder(connection).path(&path) {
            Ok(builder) => match builder.build().await {
                Ok(device) => device,
                Err(_) => continue,
            },
            Err(_) => continue,
        };
        if device.device_type().await.unwrap_or(0) == NM_DEVICE_TYPE_WIFI {
            let interface = device.interface().await.unwrap_or_default();
            return Ok((path, interface));
        }
    }
    Err(ProvisionError::NoWifiDeviceFound)
}

struct ProfileInfo {
    id: String,
    is_ap: bool,
}

/// Read the identifying settings of a profile; `None` for non-wifi profiles.
async fn profile_of(proxy: &SettingsConnectionProxy<'_>) -> Option<ProfileInfo> {
    let dict = proxy.get_settings().await.ok()?;
    let wireless = dict.get("802-11-wireless")?;
    let connection = dict.get("connection")?;
    Some(ProfileInfo {
        id: value_str(connection.get("id")?)?,
        is_ap: wireless.get("mode").and_then(value_str).as_deref() == Some("ap"),
    })
}

fn value_str(value: &OwnedValue) -> Option<String> {
    match &**value {
        Value::Str(s) => Some(s.as_str().to_owned()),
        _ => None,
    }
}

/// Profiles are only reused when their keyfile is owned by root with mode
/// 0600. The stat runs on the blocking pool.
async fn keyfile_is_trusted(path: &str) -> bool {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || match nix::sys::stat::stat(path.as_str()) {
        Ok(st) => st.st_uid == 0 && (st.st_mode & 0o777) == 0o600,
        Err(_) => false,
    })
    .await
    .unwrap_or(false)
}

/// True when the daemon refused the scan because one is already running.
fn scan_refused(error: &zbus::Error) -> bool {
    match error {
        zbus::Error::MethodError(name, message, _) => {
            name.as_str().contains("NotAllowed")
                || message
                    .as_deref()
                    .map(|m| m.to_ascii_lowercase().contains("scan"))
                    .unwrap_or(false)
        },
        _ => false,
    }
}

/// Map a device state-change reason onto the attempt error codes.
fn classify_failure(reason: u32) -> ProvisionError {
    let code = match reason {
        REASON_NO_SECRETS
        | REASON_SUPPLICANT_CONFIG_FAILED
        | REASON_SUPPLICANT_FAILED
        | REASON_SUPPLICANT_TIMEOUT => ErrorCode::AuthFail,
        REASON_SUPPLICANT_DISCONNECT | REASON_SSID_NOT_FOUND => ErrorCode::AssocFail,
        REASON_IP_CONFIG_UNAVAILABLE
        | REASON_IP_CONFIG_EXPIRED
        | REASON_DHCP_START_FAILED
        | REASON_DHCP_ERROR
        | REASON_DHCP_FAILED => ErrorCode::DhcpFail,
        _ => ErrorCode::ConnectTimeout,
    };
    ProvisionError::Connect(code, format!("device failed with reason {}", reason))
}

/// Derive the announced security from the access point flag triple.
fn classify_security(flags: u32, wpa_flags: u32, rsn_flags: u32) -> Security {
    if rsn_flags & AP_SEC_KEY_MGMT_SAE != 0 {
        Security::Wpa3
    } else if rsn_flags != 0 {
        Security::Wpa2
    } else if wpa_flags != 0 {
        Security::Wpa
    } else if flags & AP_FLAG_PRIVACY != 0 {
        Security::Wep
    } else {
        Security::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_classification() {
        assert_eq!(classify_failure(REASON_NO_SECRETS).code(), ErrorCode::AuthFail);
        assert_eq!(classify_failure(REASON_SUPPLICANT_TIMEOUT).code(), ErrorCode::AuthFail);
        assert_eq!(classify_failure(REASON_SUPPLICANT_DISCONNECT).code(), ErrorCode::AssocFail);
        assert_eq!(classify_failure(REASON_SSID_NOT_FOUND).code(), ErrorCode::AssocFail);
        assert_eq!(classify_failure(REASON_DHCP_FAILED).code(), ErrorCode::DhcpFail);
        assert_eq!(classify_failure(999).code(), ErrorCode::ConnectTimeout);
    }

    #[test]
    fn security_classification() {
        assert_eq!(classify_security(0, 0, 0), Security::Open);
        assert_eq!(classify_security(AP_FLAG_PRIVACY, 0, 0), Security::Wep);
        assert_eq!(classify_security(AP_FLAG_PRIVACY, 0x100, 0), Security::Wpa);
        assert_eq!(classify_security(AP_FLAG_PRIVACY, 0, 0x100), Security::Wpa2);
        assert_eq!(
            classify_security(AP_FLAG_PRIVACY, 0, AP_SEC_KEY_MGMT_SAE),
            Security::Wpa3
        );
    }
}
