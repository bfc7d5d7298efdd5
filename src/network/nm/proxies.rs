//! Hand-written zbus proxies for the NetworkManager interfaces this service
//! uses. Numeric daemon states arrive as raw `u32` and are converted through
//! the `From<u32>` impls below, so unknown values degrade to `Unknown` instead
//! of failing deserialisation.

use std::collections::HashMap;

use log::warn;
use zbus::proxy;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

/// Flag for `NetworkManager.Reload`: re-read DNS configuration (drop-ins
/// included) without a full daemon restart.
pub const NM_RELOAD_DNS: u32 = 0x02;

#[proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
pub trait NetworkManager {
    /// The list of realized network devices.
    fn get_devices(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    /// Activate a connection using the supplied device.
    fn activate_connection(
        &self,
        connection: ObjectPath<'_>,
        device: ObjectPath<'_>,
        specific_object: ObjectPath<'_>,
    ) -> zbus::Result<OwnedObjectPath>;

    /// Deactivate an active connection.
    fn deactivate_connection(&self, active_connection: ObjectPath<'_>) -> zbus::Result<()>;

    /// Control whether overall networking is enabled.
    fn enable(&self, enable: bool) -> zbus::Result<()>;

    /// Re-read configuration. `flags` selects what to reload; see
    /// [`NM_RELOAD_DNS`].
    fn reload(&self, flags: u32) -> zbus::Result<()>;

    /// Re-run the connectivity check and return the result.
    fn check_connectivity(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn networking_enabled(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn wireless_enabled(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_wireless_enabled(&self, enabled: bool) -> zbus::Result<()>;

    #[zbus(property)]
    fn active_connections(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    /// Overall daemon state transition. Values map through [`DaemonState`].
    #[zbus(signal)]
    fn state_changed(&self, state: u32) -> zbus::Result<()>;
}

/// Wrapped in its own module so the macro-generated `StateChanged`
/// signal types (stream/args) don't collide in the type namespace with
/// the identically-named ones generated for `NetworkManager::state_changed`
/// above.
mod device {
    use super::*;

    #[proxy(
        interface = "org.freedesktop.NetworkManager.Device",
        default_service = "org.freedesktop.NetworkManager"
    )]
    pub trait Device {
        /// Disconnect and block autoconnect until the next manual activation.
        fn disconnect(&self) -> zbus::Result<()>;

        #[zbus(property)]
        fn device_type(&self) -> zbus::Result<u32>;

        #[zbus(property)]
        fn interface(&self) -> zbus::Result<String>;

        #[zbus(property)]
        fn state(&self) -> zbus::Result<u32>;

        #[zbus(property)]
        fn ip4_config(&self) -> zbus::Result<OwnedObjectPath>;

        /// Named apart from the `State` property stream, which would otherwise
        /// claim the generated `receive_state_changed`.
        #[zbus(signal, name = "StateChanged")]
        fn device_state_changed(&self, new_state: u32, old_state: u32, reason: u32)
            -> zbus::Result<()>;
    }
}

pub use device::DeviceProxy;

#[proxy(
    interface = "org.freedesktop.NetworkManager.Device.Wireless",
    default_service = "org.freedesktop.NetworkManager"
)]
pub trait WirelessDevice {
    fn request_scan(&self, options: HashMap<String, OwnedValue>) -> zbus::Result<()>;

    #[zbus(property)]
    fn access_points(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    #[zbus(property)]
    fn active_access_point(&self) -> zbus::Result<OwnedObjectPath>;

    /// Timestamp (CLOCK_BOOTTIME ms) of the last completed scan, -1 if never.
    #[zbus(property)]
    fn last_scan(&self) -> zbus::Result<i64>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.AccessPoint",
    default_service = "org.freedesktop.NetworkManager"
)]
pub trait AccessPoint {
    #[zbus(property)]
    fn ssid(&self) -> zbus::Result<Vec<u8>>;

    #[zbus(property)]
    fn strength(&self) -> zbus::Result<u8>;

    #[zbus(property)]
    fn hw_address(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn flags(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn wpa_flags(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn rsn_flags(&self) -> zbus::Result<u32>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager/Settings"
)]
pub trait Settings {
    fn list_connections(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    fn add_connection(
        &self,
        connection: HashMap<&str, HashMap<&str, Value<'_>>>,
    ) -> zbus::Result<OwnedObjectPath>;

    fn get_connection_by_uuid(&self, uuid: &str) -> zbus::Result<OwnedObjectPath>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Settings.Connection",
    default_service = "org.freedesktop.NetworkManager"
)]
pub trait SettingsConnection {
    fn delete(&self) -> zbus::Result<()>;

    /// Settings maps, secrets excluded.
    fn get_settings(&self) -> zbus::Result<HashMap<String, HashMap<String, OwnedValue>>>;

    fn update(&self, properties: HashMap<&str, HashMap<&str, Value<'_>>>) -> zbus::Result<()>;

    /// Backing keyfile of this profile, empty for in-memory profiles.
    #[zbus(property)]
    fn filename(&self) -> zbus::Result<String>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.Connection.Active",
    default_service = "org.freedesktop.NetworkManager"
)]
pub trait ActiveConnection {
    #[zbus(property)]
    fn id(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn uuid(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn connection(&self) -> zbus::Result<OwnedObjectPath>;
}

#[proxy(
    interface = "org.freedesktop.NetworkManager.IP4Config",
    default_service = "org.freedesktop.NetworkManager"
)]
pub trait Ip4Config {
    #[zbus(property)]
    fn address_data(&self) -> zbus::Result<Vec<HashMap<String, OwnedValue>>>;
}

/// The general type of a network device.
pub const NM_DEVICE_TYPE_WIFI: u32 = 2;

/// Overall daemon state, reduced to what the provisioning logic reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Unknown,
    Asleep,
    Disconnected,
    Disconnecting,
    Connecting,
    Connected,
}

impl From<u32> for DaemonState {
    fn from(state: u32) -> Self {
        match state {
            10 => DaemonState::Asleep,
            20 => DaemonState::Disconnected,
            30 => DaemonState::Disconnecting,
            40 => DaemonState::Connecting,
            50 | 60 | 70 => DaemonState::Connected,
            0 => DaemonState::Unknown,
            other => {
                warn!("Undefined network daemon state: {}", other);
                DaemonState::Unknown
            },
        }
    }
}

/// Per-device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unknown,
    Unmanaged,
    Unavailable,
    Disconnected,
    Preparing,
    NeedAuth,
    IpConfig,
    Activated,
    Deactivating,
    Failed,
}

impl From<u32> for DeviceState {
    fn from(state: u32) -> Self {
        match state {
            10 => DeviceState::Unmanaged,
            20 => DeviceState::Unavailable,
            30 => DeviceState::Disconnected,
            40 | 50 => DeviceState::Preparing,
            60 => DeviceState::NeedAuth,
            70 | 80 | 90 => DeviceState::IpConfig,
            100 => DeviceState::Activated,
            110 => DeviceState::Deactivating,
            120 => DeviceState::Failed,
            0 => DeviceState::Unknown,
            other => {
                warn!("Undefined device state: {}", other);
                DeviceState::Unknown
            },
        }
    }
}

/// State of an active connection object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Unknown,
    Activating,
    Activated,
    Deactivating,
    Deactivated,
}

impl From<u32> for ActiveState {
    fn from(state: u32) -> Self {
        match state {
            1 => ActiveState::Activating,
            2 => ActiveState::Activated,
            3 => ActiveState::Deactivating,
            4 => ActiveState::Deactivated,
            0 => ActiveState::Unknown,
            other => {
                warn!("Undefined active connection state: {}", other);
                ActiveState::Unknown
            },
        }
    }
}

// Device state-change reasons relevant for classifying failed attempts.
pub const REASON_NO_SECRETS: u32 = 7;
pub const REASON_SUPPLICANT_DISCONNECT: u32 = 8;
pub const REASON_SUPPLICANT_CONFIG_FAILED: u32 = 9;
pub const REASON_SUPPLICANT_FAILED: u32 = 10;
pub const REASON_SUPPLICANT_TIMEOUT: u32 = 11;
pub const REASON_IP_CONFIG_UNAVAILABLE: u32 = 5;
pub const REASON_IP_CONFIG_EXPIRED: u32 = 6;
pub const REASON_DHCP_START_FAILED: u32 = 15;
pub const REASON_DHCP_ERROR: u32 = 16;
pub const REASON_DHCP_FAILED: u32 = 17;
pub const REASON_SSID_NOT_FOUND: u32 = 53;

// 802.11 access point security flag bits (Flags / WpaFlags / RsnFlags).
pub const AP_FLAG_PRIVACY: u32 = 0x1;
pub const AP_SEC_KEY_MGMT_SAE: u32 = 0x400;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_degrade_to_unknown() {
        assert_eq!(DaemonState::from(65), DaemonState::Unknown);
        assert_eq!(DeviceState::from(130), DeviceState::Unknown);
        assert_eq!(ActiveState::from(9), ActiveState::Unknown);
    }

    #[test]
    fn connected_band_collapses() {
        assert_eq!(DaemonState::from(50), DaemonState::Connected);
        assert_eq!(DaemonState::from(70), DaemonState::Connected);
    }
}
