//! # Error and Result Type
//!
//! This crate uses one wrapping error type. Sub-modules and methods return the
//! most specific variant they can; the orchestrator decides on recovery and the
//! http layer maps variants to status codes via [`ErrorCode`].

use std::error;
use std::fmt;

/// Short machine-readable codes. These travel in `SystemState.error` and in
/// http error payloads; log lines carry them next to the human message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "BAD_INPUT")]
    BadInput,
    #[serde(rename = "SCAN_BUSY")]
    ScanBusy,
    #[serde(rename = "NO_DEVICE")]
    NoDevice,
    #[serde(rename = "NO_MAC")]
    NoMac,
    #[serde(rename = "AUTH_FAIL")]
    AuthFail,
    #[serde(rename = "ASSOC_FAIL")]
    AssocFail,
    #[serde(rename = "DHCP_FAIL")]
    DhcpFail,
    #[serde(rename = "CONNECT_TIMEOUT")]
    ConnectTimeout,
    #[serde(rename = "AP_START_FAIL")]
    ApStartFail,
    #[serde(rename = "CAPTIVE_FAIL")]
    CaptiveFail,
    #[serde(rename = "TUNNEL_FAIL")]
    TunnelFail,
    #[serde(rename = "INTERNAL")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadInput => "BAD_INPUT",
            ErrorCode::ScanBusy => "SCAN_BUSY",
            ErrorCode::NoDevice => "NO_DEVICE",
            ErrorCode::NoMac => "NO_MAC",
            ErrorCode::AuthFail => "AUTH_FAIL",
            ErrorCode::AssocFail => "ASSOC_FAIL",
            ErrorCode::DhcpFail => "DHCP_FAIL",
            ErrorCode::ConnectTimeout => "CONNECT_TIMEOUT",
            ErrorCode::ApStartFail => "AP_START_FAIL",
            ErrorCode::CaptiveFail => "CAPTIVE_FAIL",
            ErrorCode::TunnelFail => "TUNNEL_FAIL",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type used throughout this crate. It wraps a few foreign error
/// types and implements [`error::Error`] so that it can be used in any situation
/// where the standard error type is expected.
#[derive(Debug)]
pub enum ProvisionError {
    /// Generic errors are rarely used and only if no other variant matches
    Generic(String),
    /// Serialisation failed
    Ser(serde_json::Error),
    Utf8(std::str::Utf8Error),
    DBus(zbus::Error),
    /// IO Error with context
    IO(std::io::Error, &'static str),
    Hyper(hyper::Error),

    /// Request body failed validation. Carries the rejected field and a reason.
    BadInput(&'static str, String),
    /// No usable MAC address on any physical interface
    NoMacAddress,
    /// No wifi device found on this system
    NoWifiDeviceFound,
    /// The os daemon refused the scan because one is already running
    ScanBusy,
    /// Starting the access point failed or timed out
    ApStartFailed(String),
    /// Captive portal side effects could not be applied
    CaptiveFailed(String),
    /// A connection attempt ended in a classified failure
    Connect(ErrorCode, String),
    /// The tunnel provider failed; never affects connection state
    Tunnel(String),
}

impl ProvisionError {
    /// The wire code the http layer and `SystemState.error` use for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProvisionError::BadInput(..) => ErrorCode::BadInput,
            ProvisionError::NoMacAddress => ErrorCode::NoMac,
            ProvisionError::NoWifiDeviceFound => ErrorCode::NoDevice,
            ProvisionError::ScanBusy => ErrorCode::ScanBusy,
            ProvisionError::ApStartFailed(_) => ErrorCode::ApStartFail,
            ProvisionError::CaptiveFailed(_) => ErrorCode::CaptiveFail,
            ProvisionError::Connect(code, _) => *code,
            ProvisionError::Tunnel(_) => ErrorCode::TunnelFail,
            _ => ErrorCode::Internal,
        }
    }

    /// True for errors the caller may retry after a short backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProvisionError::ScanBusy | ProvisionError::Connect(ErrorCode::AssocFail, _)
        )
    }
}

impl From<std::convert::Infallible> for ProvisionError {
    fn from(error: std::convert::Infallible) -> Self {
        ProvisionError::Generic(error.to_string())
    }
}

impl From<hyper::Error> for ProvisionError {
    fn from(error: hyper::Error) -> Self {
        ProvisionError::Hyper(error)
    }
}

impl From<std::string::FromUtf8Error> for ProvisionError {
    fn from(error: std::string::FromUtf8Error) -> Self {
        ProvisionError::Utf8(error.utf8_error())
    }
}

impl From<String> for ProvisionError {
    fn from(error: String) -> Self {
        ProvisionError::Generic(error)
    }
}

impl From<std::io::Error> for ProvisionError {
    fn from(error: std::io::Error) -> Self {
        ProvisionError::IO(error, "")
    }
}

impl From<serde_json::Error> for ProvisionError {
    fn from(error: serde_json::Error) -> Self {
        ProvisionError::Ser(error)
    }
}

impl From<std::str::Utf8Error> for ProvisionError {
    fn from(error: std::str::Utf8Error) -> Self {
        ProvisionError::Utf8(error)
    }
}

impl From<zbus::Error> for ProvisionError {
    fn from(error: zbus::Error) -> Self {
        ProvisionError::DBus(error)
    }
}

impl From<zbus::zvariant::Error> for ProvisionError {
    fn from(error: zbus::zvariant::Error) -> Self {
        ProvisionError::DBus(zbus::Error::Variant(error))
    }
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProvisionError::Generic(m) => m.fmt(f),
            ProvisionError::IO(e, ctx) if ctx.is_empty() => e.fmt(f),
            ProvisionError::IO(e, ctx) => write!(f, "{} - {}", ctx, e),
            ProvisionError::Hyper(e) => e.fmt(f),
            ProvisionError::Utf8(e) => e.fmt(f),
            ProvisionError::DBus(e) => write!(f, "Dbus Error: {}", e),
            ProvisionError::Ser(e) => e.fmt(f),
            ProvisionError::BadInput(field, reason) => {
                write!(f, "Invalid {}: {}", field, reason)
            },
            ProvisionError::NoMacAddress => {
                write!(f, "No usable MAC address on any physical interface")
            },
            ProvisionError::NoWifiDeviceFound => write!(f, "No wifi device found on this system"),
            ProvisionError::ScanBusy => write!(f, "A wifi scan is already in progress"),
            ProvisionError::ApStartFailed(m) => write!(f, "Failed to start access point: {}", m),
            ProvisionError::CaptiveFailed(m) => write!(f, "Captive portal setup failed: {}", m),
            ProvisionError::Connect(code, m) => {
                write!(f, "Connection attempt failed ({}): {}", code, m)
            },
            ProvisionError::Tunnel(m) => write!(f, "Tunnel provider failed: {}", m),
        }
    }
}

impl error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ProvisionError::IO(e, _) => Some(e),
            ProvisionError::Hyper(e) => Some(e),
            ProvisionError::Utf8(e) => Some(e),
            ProvisionError::Ser(e) => Some(e),
            ProvisionError::DBus(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialise_as_wire_names() {
        assert_eq!(ErrorCode::AuthFail.as_str(), "AUTH_FAIL");
        assert_eq!(
            serde_json::to_string(&ErrorCode::ConnectTimeout).unwrap(),
            "\"CONNECT_TIMEOUT\""
        );
    }

    #[test]
    fn classification() {
        assert_eq!(
            ProvisionError::BadInput("ssid", "empty".into()).code(),
            ErrorCode::BadInput
        );
        assert!(ProvisionError::ScanBusy.is_transient());
        assert!(ProvisionError::Connect(ErrorCode::AssocFail, String::new()).is_transient());
        assert!(!ProvisionError::Connect(ErrorCode::AuthFail, String::new()).is_transient());
    }
}
