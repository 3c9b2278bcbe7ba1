//! API key resolution and the stored credential override.
//!
//! The override lives in the OS's native secret storage:
//! - Linux: kernel keyutils keyring
//! - macOS: Keychain
//! - Windows: Credential Manager
//!
//! Resolution order: stored override, then the `GEMINI_API_KEY`
//! environment variable. Never log the key value.

use keyring::Entry;

const SERVICE_NAME: &str = "live-voice";
const API_KEY_NAME: &str = "gemini-api-key";

/// Environment variable consulted when no override is stored
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CredentialError {
    #[error("Failed to open keyring entry: {0}")]
    Entry(String),
    #[error("Failed to store credential: {0}")]
    Store(String),
    #[error("Failed to delete credential: {0}")]
    Delete(String),
}

/// Where a resolved key came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Override,
    Environment,
}

impl KeySource {
    pub fn describe(self) -> &'static str {
        match self {
            KeySource::Override => "stored credential override",
            KeySource::Environment => API_KEY_ENV,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub value: String,
    pub source: KeySource,
}

// Keep the key out of debug output
impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("value", &mask_key(&self.value))
            .field("source", &self.source)
            .finish()
    }
}

fn entry(name: &str) -> Result<Entry, CredentialError> {
    Entry::new(SERVICE_NAME, name).map_err(|e| CredentialError::Entry(e.to_string()))
}

/// Retrieve the stored override, if any.
/// Returns None if not configured or on error (errors are logged).
pub fn get_api_key_override() -> Option<String> {
    load_secret(API_KEY_NAME)
}

/// Store the override. Pass None (or an empty key) to delete it.
pub fn set_api_key_override(key: Option<&str>) -> Result<(), CredentialError> {
    store_secret(API_KEY_NAME, key)
}

fn load_secret(name: &str) -> Option<String> {
    let entry = match entry(name) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("Credentials: {}", e);
            return None;
        }
    };

    match entry.get_password() {
        Ok(key) if key.trim().is_empty() => None,
        Ok(key) => Some(key.trim().to_string()),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            log::warn!("Credentials: failed to retrieve override: {}", e);
            None
        }
    }
}

fn store_secret(name: &str, key: Option<&str>) -> Result<(), CredentialError> {
    let entry = entry(name)?;

    match key.map(str::trim) {
        Some(k) if !k.is_empty() => {
            entry
                .set_password(k)
                .map_err(|e| CredentialError::Store(e.to_string()))?;
            log::info!("Credentials: stored {}", name);
        }
        _ => match entry.delete_credential() {
            Ok(()) => log::info!("Credentials: deleted {}", name),
            Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(CredentialError::Delete(e.to_string())),
        },
    }

    Ok(())
}

/// Pick the key to use from the override and the environment
pub fn resolve_from(override_key: Option<String>, env_key: Option<String>) -> Option<ApiKey> {
    let clean = |k: Option<String>| k.map(|k| k.trim().to_string()).filter(|k| !k.is_empty());

    clean(override_key)
        .map(|value| ApiKey {
            value,
            source: KeySource::Override,
        })
        .or_else(|| {
            clean(env_key).map(|value| ApiKey {
                value,
                source: KeySource::Environment,
            })
        })
}

pub fn resolve_api_key() -> Option<ApiKey> {
    resolve_from(get_api_key_override(), std::env::var(API_KEY_ENV).ok())
}

/// Masked form for display (e.g. "AIz...abc123")
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 6..].iter().collect();
        format!("{}...{}", head, tail)
    }
}
