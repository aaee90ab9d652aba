//! Secret storage in the OS credential store.
//!
//! Uses the platform keyring through the `keyring` crate: Keychain on
//! macOS, the Windows credential manager, and the Secret Service API on
//! Linux. Environment variables always win over stored values; see
//! [`crate::config`].

use keyring::Entry;
use tracing::{info, warn};

const SERVICE_NAME: &str = "service-queue";

pub const KEY_SUPABASE_URL: &str = "supabase_url";
pub const KEY_SUPABASE_ANON_KEY: &str = "supabase_anon_key";
pub const KEY_SMS_WEBHOOK_URL: &str = "sms_webhook_url";

/// All credential keys managed by this module.
pub const ALL_KEYS: &[&str] = &[KEY_SUPABASE_URL, KEY_SUPABASE_ANON_KEY, KEY_SMS_WEBHOOK_URL];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential. Returns `None` when the entry does not
/// exist or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) if pw.trim().is_empty() => None,
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    if !ALL_KEYS.contains(&key) {
        return Err(format!("Unknown credential key: {key}"));
    }
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value.trim()).map_err(|e| e.to_string())?;
    info!(key, "keyring: credential stored");
    Ok(())
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

/// Remove every stored credential. Returns the keys that could not be
/// deleted.
pub fn clear_credentials() -> Vec<String> {
    let mut failed = Vec::new();
    for key in ALL_KEYS {
        if let Err(e) = delete_credential(key) {
            warn!(key, error = %e, "keyring: failed to delete credential");
            failed.push((*key).to_string());
        }
    }
    info!(failed = failed.len(), "keyring: credentials cleared");
    failed
}
