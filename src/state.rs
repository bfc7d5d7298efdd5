//! # The system data model
//!
//! One [`SystemState`] exists per process; it is owned by the
//! [`store::StateStore`](crate::store::StateStore) and every other component
//! reads snapshots of it. Scan results and status payloads live here too so
//! that the http layer, the display sink and the persistence code agree on one
//! wire shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ErrorCode;

/// The provisioning state machine's externally visible position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    ApMode,
    Switching,
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::ApMode => "AP_MODE",
            ConnectionState::Switching => "SWITCHING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Failed => "FAILED",
            ConnectionState::Disconnected => "DISCONNECTED",
        }
    }
}

/// Which tunnel provider currently serves `tunnel_url`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelProvider {
    Managed,
    Ssh,
    None,
}

/// Short error code plus human readable message, as surfaced in status payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorInfo { code, message: message.into() }
    }
}

/// The single, process-wide system snapshot.
///
/// `ap_password` is deliberately skipped during serialisation: the persisted
/// snapshot on disk must never contain it (it is regenerated on every AP
/// entry), and status payloads add it back explicitly while in AP mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub connection_state: ConnectionState,
    /// Currently targeted or connected network name, empty otherwise
    #[serde(default)]
    pub ssid: String,
    /// Current IPv4 on the primary interface, empty otherwise
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub signal_dbm: Option<i32>,
    /// Regenerated on every entry into AP mode, never written to disk
    #[serde(skip)]
    pub ap_password: String,
    #[serde(default)]
    pub tunnel_url: Option<String>,
    pub tunnel_provider: TunnelProvider,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    /// Updated on each user-initiated connect
    pub session_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

impl Default for SystemState {
    fn default() -> Self {
        SystemState {
            connection_state: ConnectionState::Disconnected,
            ssid: String::new(),
            ip_address: String::new(),
            signal_dbm: None,
            ap_password: String::new(),
            tunnel_url: None,
            tunnel_provider: TunnelProvider::None,
            error: None,
            session_id: Uuid::new_v4(),
            updated_at: Utc::now(),
        }
    }
}

impl SystemState {
    /// The status payload served by `/api/status` and pushed over `/ws`.
    /// Secrets stay out except for the AP password, which is part of the
    /// provisioning UX and only exposed while the access point is up.
    pub fn status_json(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "state": self.connection_state.as_str(),
            "ssid": self.ssid,
            "ip_address": self.ip_address,
            "signal_dbm": self.signal_dbm,
            "tunnel_url": self.tunnel_url,
            "error": self.error,
            "session_id": self.session_id,
            "updated_at": self.updated_at.to_rfc3339(),
        });
        if self.connection_state == ConnectionState::ApMode {
            value["ap_password"] = serde_json::Value::String(self.ap_password.clone());
        }
        value
    }
}

/// A wifi SSID.
/// According to 802.11-2012 (Section 6.3.11.2.2) an SSID is 0-32 octets with
/// an unspecified or UTF8 encoding.
pub type Ssid = String;

/// The encryption announced by a scanned access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Security {
    Open,
    Wep,
    Wpa,
    Wpa2,
    Wpa3,
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Security::Open => "OPEN",
            Security::Wep => "WEP",
            Security::Wpa => "WPA",
            Security::Wpa2 => "WPA2",
            Security::Wpa3 => "WPA3",
        }
    }
}

/// One network as reported by a scan, after deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: Ssid,
    /// Signal strength in percent (0-100)
    pub signal_percent: u8,
    pub security: Security,
    /// True if the device is currently associated with this network
    pub in_use: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_wire_names() {
        assert_eq!(serde_json::to_string(&ConnectionState::ApMode).unwrap(), "\"AP_MODE\"");
        assert_eq!(
            serde_json::from_str::<ConnectionState>("\"CONNECTED\"").unwrap(),
            ConnectionState::Connected
        );
    }

    #[test]
    fn ap_password_never_serialised() {
        let mut state = SystemState::default();
        state.ap_password = "super-secret12".to_owned();
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("super-secret12"));
        assert!(!json.contains("ap_password"));
    }

    #[test]
    fn status_payload_gates_ap_password_on_state() {
        let mut state = SystemState::default();
        state.ap_password = "pw-for-the-ap".to_owned();

        state.connection_state = ConnectionState::Connected;
        let status = state.status_json();
        assert!(status.get("ap_password").is_none());

        state.connection_state = ConnectionState::ApMode;
        let status = state.status_json();
        assert_eq!(status["ap_password"], "pw-for-the-ap");
        assert_eq!(status["state"], "AP_MODE");
    }

    #[test]
    fn snapshot_roundtrips_without_secrets() {
        let mut state = SystemState::default();
        state.connection_state = ConnectionState::Connected;
        state.ssid = "HomeNet".to_owned();
        state.ip_address = "10.0.0.17".to_owned();
        state.ap_password = "will-not-survive".to_owned();

        let json = serde_json::to_string(&state).unwrap();
        let restored: SystemState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.ssid, "HomeNet");
        assert_eq!(restored.connection_state, ConnectionState::Connected);
        assert!(restored.ap_password.is_empty());
    }
}
