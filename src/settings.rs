use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coaching::{CoachingClient, DEFAULT_COACHING_URL};
use crate::effects::RunnerConfig;
use crate::live::protocol::{DEFAULT_MODEL, DEFAULT_VOICE, LIVE_API_URL};
use crate::live::{LiveConfig, ProxyConfig, RetryPolicy};
use crate::preview::DEFAULT_PREVIEW_MODEL;
use crate::state_machine::SessionOptions;

const APP_DIR_NAME: &str = "live-voice";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Shortest connection age accepted before a proactive recycle
const MIN_RECYCLE_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to {action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Unknown setting '{0}'")]
    UnknownKey(String),
    #[error("Invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Live model id, with or without the `models/` prefix
    pub model: String,

    /// Prebuilt voice used when the persona does not pick one
    pub voice: String,

    /// Live API WebSocket endpoint
    pub endpoint: String,

    /// Route the live connection through this base URL (scheme + host)
    pub proxy_url: Option<String>,

    /// Near-silent frame period while a connection is open
    pub keepalive_secs: u64,

    /// Connection age at which an idle connection is replaced
    pub recycle_secs: u64,

    pub max_reconnect_attempts: u32,

    /// Finalized turns replayed into the system instruction on reconnect
    pub context_turns: usize,

    /// Post finalized user turns to the coaching backend
    pub coaching_enabled: bool,
    pub coaching_url: String,
    pub coaching_user_id: String,

    /// Model used for voice previews
    pub preview_model: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            endpoint: LIVE_API_URL.to_string(),
            proxy_url: None,
            keepalive_secs: 20,
            recycle_secs: 270,
            max_reconnect_attempts: 5,
            context_turns: 10,
            coaching_enabled: false,
            coaching_url: DEFAULT_COACHING_URL.to_string(),
            coaching_user_id: "local-user".to_string(),
            preview_model: DEFAULT_PREVIEW_MODEL.to_string(),
        }
    }
}

impl AppSettings {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            retry: RetryPolicy {
                max_attempts: self.max_reconnect_attempts,
                ..RetryPolicy::default()
            },
            // Below the floor every tick would replace the connection
            recycle_after: Duration::from_secs(self.recycle_secs.max(MIN_RECYCLE_SECS)),
            context_turns: self.context_turns,
            coaching_enabled: self.coaching_enabled,
        }
    }

    pub fn live_config(&self, api_key: impl Into<String>) -> LiveConfig {
        let mut config = LiveConfig::new(api_key, self.model.clone());
        config.endpoint = self.endpoint.clone();
        config
    }

    pub fn runner_config(&self, api_key: impl Into<String>) -> RunnerConfig {
        let mut config = RunnerConfig::new(self.live_config(api_key));
        config.default_voice = self.voice.clone();
        // Zero would spin the keepalive timer
        config.keepalive_interval = Duration::from_secs(self.keepalive_secs.max(1));
        config
    }

    pub fn proxy(&self) -> Option<ProxyConfig> {
        self.proxy_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(ProxyConfig::new)
    }

    /// Set one field from its command-line text form.
    ///
    /// `null` clears an optional field. Otherwise string fields take `raw`
    /// verbatim and other fields parse it as JSON (`45`, `true`).
    pub fn set_field(&mut self, key: &str, raw: &str) -> Result<(), SettingsError> {
        let mut value = serde_json::to_value(&*self)?;
        let slot = value
            .get_mut(key)
            .ok_or_else(|| SettingsError::UnknownKey(key.to_string()))?;

        let parsed = match &*slot {
            _ if raw == "null" => serde_json::Value::Null,
            serde_json::Value::String(_) => serde_json::Value::String(raw.to_string()),
            _ => serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
        };
        *slot = parsed;

        *self = serde_json::from_value(value).map_err(|e| SettingsError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// Coaching client, when coaching is enabled
    pub fn coaching_client(&self) -> Option<CoachingClient> {
        self.coaching_enabled
            .then(|| CoachingClient::new(self.coaching_url.clone(), self.coaching_user_id.clone()))
    }
}

/// `<config dir>/live-voice/settings.json`
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings, falling back to defaults when the file is missing or
/// unreadable
pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
            action: "create config directory",
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a temp file in the same directory, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|source| SettingsError::Io {
        action: "write temp settings",
        path: tmp_path.clone(),
        source,
    })?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(source) = std::fs::remove_file(path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                return Err(SettingsError::Io {
                    action: "remove existing settings",
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| SettingsError::Io {
        action: "rename temp settings onto",
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("Settings saved to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("nope.json"));
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"voice": "Kore", "recycle_secs": 120}"#).unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.voice, "Kore");
        assert_eq!(settings.recycle_secs, 120);
        assert_eq!(settings.keepalive_secs, 20);
        assert_eq!(settings.session_options().recycle_after, Duration::from_secs(120));
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), AppSettings::default());
    }

    #[test]
    fn test_save_creates_dirs_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = AppSettings {
            coaching_enabled: true,
            proxy_url: Some("https://proxy.example".into()),
            ..AppSettings::default()
        };

        save_settings(&path, &settings).unwrap();

        assert_eq!(load_settings(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_set_field_parses_by_type() {
        let mut settings = AppSettings::default();
        settings.set_field("voice", "Kore").unwrap();
        settings.set_field("keepalive_secs", "45").unwrap();
        settings.set_field("coaching_enabled", "true").unwrap();
        settings.set_field("proxy_url", "https://proxy.example").unwrap();

        assert_eq!(settings.voice, "Kore");
        assert_eq!(settings.keepalive_secs, 45);
        assert!(settings.coaching_enabled);
        assert_eq!(settings.proxy_url.as_deref(), Some("https://proxy.example"));

        settings.set_field("proxy_url", "null").unwrap();
        assert_eq!(settings.proxy_url, None);
    }

    #[test]
    fn test_set_field_rejects_unknown_and_invalid() {
        let mut settings = AppSettings::default();
        assert!(matches!(
            settings.set_field("volume", "11"),
            Err(SettingsError::UnknownKey(key)) if key == "volume"
        ));
        assert!(matches!(
            settings.set_field("keepalive_secs", "soon"),
            Err(SettingsError::InvalidValue { .. })
        ));
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn test_set_then_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = load_settings(&path);
        settings.set_field("model", "models/other-live").unwrap();
        save_settings(&path, &settings).unwrap();

        assert_eq!(load_settings(&path).model, "models/other-live");
    }

    #[test]
    fn test_recycle_ceiling_has_a_floor() {
        let settings = AppSettings {
            recycle_secs: 0,
            ..AppSettings::default()
        };
        assert_eq!(
            settings.session_options().recycle_after,
            Duration::from_secs(MIN_RECYCLE_SECS)
        );
    }

    #[test]
    fn test_blank_proxy_is_ignored() {
        let settings = AppSettings {
            proxy_url: Some("  ".into()),
            ..AppSettings::default()
        };
        assert!(settings.proxy().is_none());
    }

    #[test]
    fn test_coaching_client_only_when_enabled() {
        assert!(AppSettings::default().coaching_client().is_none());
        let settings = AppSettings {
            coaching_enabled: true,
            ..AppSettings::default()
        };
        assert!(settings.coaching_client().is_some());
    }
}
