//! # Utility methods: input validation and password generation

use rand::rngs::OsRng;
use rand::seq::SliceRandom;

use crate::errors::ProvisionError;

/// Characters rejected everywhere: anything that could escape into a shell or
/// confuse the os daemon's keyfiles. Backslash is included alongside the
/// metacharacters because NetworkManager keyfile escaping is not under our
/// control.
const FORBIDDEN: &[char] = &[';', '&', '|', '`', '$', '\n', '\r', '\0', '\\'];

/// Alphabet for generated AP passwords. Alphanumerics plus symbols that are
/// unambiguous on e-ink displays and safe in keyfiles and shells.
const PASSWORD_ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789-+*!";

/// Length of generated AP passwords.
pub const AP_PASSWORD_LEN: usize = 12;

fn has_forbidden(input: &str) -> Option<char> {
    input.chars().find(|c| FORBIDDEN.contains(c) || c.is_ascii_control())
}

/// An SSID must be 1-32 bytes, free of NUL, ASCII control characters and shell
/// metacharacters.
pub fn validate_ssid(ssid: &str) -> Result<(), ProvisionError> {
    if ssid.is_empty() {
        return Err(ProvisionError::BadInput("ssid", "must not be empty".to_owned()));
    }
    if ssid.len() > 32 {
        return Err(ProvisionError::BadInput(
            "ssid",
            format!("must be at most 32 bytes, got {}", ssid.len()),
        ));
    }
    if let Some(c) = has_forbidden(ssid) {
        return Err(ProvisionError::BadInput(
            "ssid",
            format!("contains forbidden character {:?}", c),
        ));
    }
    Ok(())
}

/// A pre-shared key must be empty (open network) or 8-63 bytes, with the same
/// character restrictions as SSIDs.
pub fn validate_psk(psk: &str) -> Result<(), ProvisionError> {
    if psk.is_empty() {
        return Ok(());
    }
    if psk.len() < 8 {
        return Err(ProvisionError::BadInput(
            "password",
            format!("must be at least 8 bytes, got {}", psk.len()),
        ));
    }
    if psk.len() > 63 {
        return Err(ProvisionError::BadInput(
            "password",
            format!("must be at most 63 bytes, got {}", psk.len()),
        ));
    }
    if let Some(c) = has_forbidden(psk) {
        return Err(ProvisionError::BadInput(
            "password",
            format!("contains forbidden character {:?}", c),
        ));
    }
    Ok(())
}

/// Draw a fresh AP password from the OS random number generator.
/// Called on every entry into AP mode; the previous password is discarded.
pub fn generate_ap_password() -> String {
    let mut rng = OsRng;
    (0..AP_PASSWORD_LEN)
        .map(|_| {
            *PASSWORD_ALPHABET
                .choose(&mut rng)
                .expect("password alphabet is non-empty") as char
        })
        .collect()
}
