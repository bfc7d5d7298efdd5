//! NetworkManager connection settings are submitted as nested maps of
//! variants rather than typed properties. This module builds those data
//! containers for the two profile shapes the service creates: a station
//! profile per user network and the single AP-mode profile.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use zbus::zvariant::Value;

/// The AP profile carries a fixed UUID so a stale profile from a crashed
/// previous run can be found and removed before each AP start.
pub const AP_PROFILE_UUID: &str = "8f1b9a52-6c24-4a34-9b7e-3fb402a1c85d";

/// Human readable id of the AP profile. Station profiles use the SSID as id.
pub const AP_PROFILE_ID: &str = "Provisioning AP";

pub type SettingsMap<'a> = HashMap<&'a str, HashMap<&'a str, Value<'a>>>;

fn add<'a>(map: &mut HashMap<&'a str, Value<'a>>, key: &'a str, value: impl Into<Value<'a>>) {
    map.insert(key, value.into());
}

/// Settings for a station (infrastructure) profile. The profile is named
/// after the SSID and saved to disk by the daemon; `psk` stays in memory
/// until handed over here.
pub fn station_profile<'a>(ssid: &'a str, psk: Option<&'a str>, hidden: bool) -> SettingsMap<'a> {
    let mut settings: SettingsMap = HashMap::new();

    let mut connection = HashMap::new();
    add(&mut connection, "id", ssid);
    add(&mut connection, "type", "802-11-wireless");
    add(&mut connection, "autoconnect", true);
    settings.insert("connection", connection);

    let mut wireless = HashMap::new();
    add(&mut wireless, "ssid", ssid.as_bytes().to_vec());
    add(&mut wireless, "mode", "infrastructure");
    add(&mut wireless, "hidden", hidden);
    settings.insert("802-11-wireless", wireless);

    if let Some(psk) = psk {
        let mut security = HashMap::new();
        add(&mut security, "key-mgmt", "wpa-psk");
        add(&mut security, "auth-alg", "open");
        add(&mut security, "psk", psk);
        settings.insert("802-11-wireless-security", security);
    }

    let mut ipv4 = HashMap::new();
    add(&mut ipv4, "method", "auto");
    settings.insert("ipv4", ipv4);

    let mut ipv6 = HashMap::new();
    add(&mut ipv6, "method", "auto");
    settings.insert("ipv6", ipv6);

    settings
}

/// Settings for the WPA2-PSK access point profile with a static address on
/// the wifi interface. The profile must never autoconnect; the orchestrator
/// decides when AP mode is entered.
pub fn ap_profile<'a>(
    ssid: &'a str,
    psk: &'a str,
    channel: u8,
    address: Ipv4Addr,
    interface: &'a str,
) -> SettingsMap<'a> {
    let mut settings: SettingsMap = HashMap::new();

    let mut connection = HashMap::new();
    add(&mut connection, "id", AP_PROFILE_ID);
    add(&mut connection, "uuid", AP_PROFILE_UUID);
    add(&mut connection, "type", "802-11-wireless");
    add(&mut connection, "interface-name", interface);
    add(&mut connection, "autoconnect", false);
    settings.insert("connection", connection);

    let mut wireless = HashMap::new();
    add(&mut wireless, "ssid", ssid.as_bytes().to_vec());
    add(&mut wireless, "mode", "ap");
    add(&mut wireless, "band", "bg");
    add(&mut wireless, "channel", u32::from(channel));
    add(&mut wireless, "hidden", false);
    settings.insert("802-11-wireless", wireless);

    let mut security = HashMap::new();
    add(&mut security, "key-mgmt", "wpa-psk");
    add(&mut security, "psk", psk);
    add(&mut security, "proto", vec!["rsn".to_owned()]);
    add(&mut security, "group", vec!["ccmp".to_owned()]);
    add(&mut security, "pairwise", vec!["ccmp".to_owned()]);
    settings.insert("802-11-wireless-security", security);

    let mut addr_data: HashMap<&str, Value> = HashMap::new();
    add(&mut addr_data, "address", address.to_string());
    add(&mut addr_data, "prefix", 24_u32);

    let mut ipv4 = HashMap::new();
    add(&mut ipv4, "method", "shared");
    add(&mut ipv4, "address-data", vec![addr_data]);
    settings.insert("ipv4", ipv4);

    let mut ipv6 = HashMap::new();
    add(&mut ipv6, "method", "disabled");
    settings.insert("ipv6", ipv6);

    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn station_profile_shape() {
        let settings = station_profile("HomeNet", Some("hunter2hunter2"), false);
        assert!(settings.contains_key("connection"));
        assert!(settings.contains_key("802-11-wireless"));
        assert!(settings.contains_key("802-11-wireless-security"));
        assert_eq!(settings["ipv4"]["method"], Value::from("auto"));
    }

    #[test]
    fn open_station_profile_has_no_security_block() {
        let settings = station_profile("CoffeeShop", None, false);
        assert!(!settings.contains_key("802-11-wireless-security"));
    }

    #[test]
    fn ap_profile_shape() {
        let settings = ap_profile("Distiller-34AB", "pw12pw12pw12", 6, Ipv4Addr::new(192, 168, 4, 1), "wlan0");
        assert_eq!(settings["802-11-wireless"]["mode"], Value::from("ap"));
        assert_eq!(settings["802-11-wireless"]["channel"], Value::from(6_u32));
        assert_eq!(settings["connection"]["autoconnect"], Value::from(false));
        assert_eq!(settings["ipv4"]["method"], Value::from("shared"));
    }
}
