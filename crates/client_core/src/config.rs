use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::watch::DEFAULT_LOG_CAPACITY;

pub const DEFAULT_SETTINGS_FILE: &str = "zkview.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub connect_string: String,
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
    pub auto_refresh: bool,
    pub event_log_capacity: usize,
    pub root: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_string: "127.0.0.1:2181".into(),
            session_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            auto_refresh: false,
            event_log_capacity: DEFAULT_LOG_CAPACITY,
            root: "/".into(),
        }
    }
}

/// On-disk form; every key is optional and overrides the default.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connect_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_refresh: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_log_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    root: Option<String>,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to write settings to '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode settings: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Defaults, then the settings file at `path` (usually `zkview.toml`), then
/// `ZKVIEW_*` environment variables.
pub fn load_settings(path: &Path) -> ClientSettings {
    let mut settings = load_settings_from(path);
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Defaults overlaid with `path` when it exists and parses.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();
    let Ok(raw) = fs::read_to_string(path) else {
        return settings;
    };
    match toml::from_str::<FileSettings>(&raw) {
        Ok(file_cfg) => apply_file(&mut settings, file_cfg),
        Err(err) => warn!(path = %path.display(), "config: ignoring unreadable settings file: {err}"),
    }
    settings
}

fn apply_file(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.url {
        settings.connect_string = v;
    }
    if let Some(v) = file_cfg.session_timeout_ms {
        settings.session_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.connect_timeout_ms {
        settings.connect_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.auto_refresh {
        settings.auto_refresh = v;
    }
    if let Some(v) = file_cfg.event_log_capacity {
        settings.event_log_capacity = v;
    }
    if let Some(v) = file_cfg.root {
        settings.root = v;
    }
}

/// Applies `ZKVIEW_*` overrides read through `lookup`. Unparseable numeric or
/// boolean values are ignored with a warning.
pub fn apply_env(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("ZKVIEW_URL") {
        settings.connect_string = v;
    }
    if let Some(v) = lookup("ZKVIEW_SESSION_TIMEOUT_MS") {
        match v.parse::<u64>() {
            Ok(ms) => settings.session_timeout = Duration::from_millis(ms),
            Err(_) => warn!("config: ZKVIEW_SESSION_TIMEOUT_MS '{v}' is not a number"),
        }
    }
    if let Some(v) = lookup("ZKVIEW_CONNECT_TIMEOUT_MS") {
        match v.parse::<u64>() {
            Ok(ms) => settings.connect_timeout = Duration::from_millis(ms),
            Err(_) => warn!("config: ZKVIEW_CONNECT_TIMEOUT_MS '{v}' is not a number"),
        }
    }
    if let Some(v) = lookup("ZKVIEW_AUTO_REFRESH") {
        match parse_flag(&v) {
            Some(flag) => settings.auto_refresh = flag,
            None => warn!("config: ZKVIEW_AUTO_REFRESH '{v}' is not a boolean"),
        }
    }
    if let Some(v) = lookup("ZKVIEW_EVENT_LOG_CAPACITY") {
        match v.parse::<usize>() {
            Ok(capacity) => settings.event_log_capacity = capacity,
            Err(_) => warn!("config: ZKVIEW_EVENT_LOG_CAPACITY '{v}' is not a number"),
        }
    }
    if let Some(v) = lookup("ZKVIEW_ROOT") {
        settings.root = v;
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ClientSettings {
    /// Persists the remembered connection string and auto-refresh flag into
    /// `path`, keeping any other keys already there.
    pub fn remember(&self, path: &Path) -> Result<(), SettingsError> {
        let mut file_cfg = fs::read_to_string(path)
            .ok()
            .and_then(|raw| toml::from_str::<FileSettings>(&raw).ok())
            .unwrap_or_default();
        file_cfg.url = Some(self.connect_string.clone());
        file_cfg.auto_refresh = Some(self.auto_refresh);
        let encoded = toml::to_string(&file_cfg)?;
        fs::write(path, encoded).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
