//! Client settings: compiled defaults, then `~/.timeline/settings.json`,
//! then `TIMELINE_*` environment variables.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SettingsError;
use timeline_telemetry::DEFAULT_HISTORY_CAPACITY;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// `http://` or `https://` origin of the timeline server.
    pub base_url: String,
    /// Path prefix in front of `/api/timeline` and `/ws`, e.g. `/chat`.
    pub base_prefix: String,
    pub ready_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    /// Fetch a snapshot after the stream opens.
    pub hydrate: bool,
    /// Raw frames retained per conversation for diagnostics.
    pub history_capacity: usize,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            base_prefix: String::new(),
            ready_timeout_ms: 5_000,
            fetch_timeout_ms: 10_000,
            hydrate: true,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            log_level: "info".into(),
            log_json: false,
        }
    }
}

impl ClientSettings {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| SettingsError::InvalidValue(format!("baseUrl {:?}: {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SettingsError::InvalidValue(format!(
                "baseUrl must be http or https, got {}",
                url.scheme()
            )));
        }
        if !self.base_prefix.is_empty() && !self.base_prefix.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "basePrefix must start with '/', got {:?}",
                self.base_prefix
            )));
        }
        Ok(())
    }
}

/// Resolve the path to the settings file (`~/.timeline/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".timeline").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ClientSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings, SettingsError> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn load_file(path: &Path) -> Result<ClientSettings, SettingsError> {
    let defaults = serde_json::to_value(ClientSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Overlay `source` on `target`. Only objects merge; a `null` in the file
/// leaves the default alone.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TIMELINE_*` environment overrides. Invalid values are ignored.
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`, so parsing is testable without
/// touching the process environment.
pub fn apply_overrides_from<L>(settings: &mut ClientSettings, lookup: L)
where
    L: Fn(&str) -> Option<String>,
{
    if let Some(v) = read_string(&lookup, "TIMELINE_BASE_URL") {
        settings.base_url = v;
    }
    if let Some(v) = lookup("TIMELINE_BASE_PREFIX") {
        settings.base_prefix = v;
    }
    if let Some(v) = read_in_range(&lookup, "TIMELINE_READY_TIMEOUT_MS", 100..=600_000) {
        settings.ready_timeout_ms = v;
    }
    if let Some(v) = read_in_range(&lookup, "TIMELINE_FETCH_TIMEOUT_MS", 100..=600_000) {
        settings.fetch_timeout_ms = v;
    }
    if let Some(v) = read_bool(&lookup, "TIMELINE_HYDRATE") {
        settings.hydrate = v;
    }
    if let Some(v) = read_in_range(&lookup, "TIMELINE_HISTORY_CAPACITY", 0..=100_000) {
        settings.history_capacity = v;
    }
    if let Some(v) = read_string(&lookup, "TIMELINE_LOG_LEVEL") {
        if timeline_telemetry::parse_level(&v).is_some() {
            settings.log_level = v;
        } else {
            warn!(key = "TIMELINE_LOG_LEVEL", value = %v, "invalid log level env var, ignoring");
        }
    }
}

pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_string<L: Fn(&str) -> Option<String>>(lookup: &L, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.is_empty())
}

fn read_bool<L: Fn(&str) -> Option<String>>(lookup: &L, name: &str) -> Option<bool> {
    let val = lookup(name)?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_in_range<L, T>(lookup: &L, name: &str, range: RangeInclusive<T>) -> Option<T>
where
    L: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd,
{
    let val = lookup(name)?;
    let result = val.trim().parse::<T>().ok().filter(|n| range.contains(n));
    if result.is_none() {
        warn!(key = name, value = %val, "env var out of range or not a number, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let merged = deep_merge(
            json!({"a": {"x": 1, "y": 2}, "b": [1, 2]}),
            json!({"a": {"x": 10}, "b": [3], "c": null}),
        );
        assert_eq!(merged, json!({"a": {"x": 10, "y": 2}, "b": [3]}));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_file(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, ClientSettings::default());
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"baseUrl": "https://chat.example.com", "hydrate": false}"#).unwrap();
        let settings = load_file(&path).unwrap();
        assert_eq!(settings.base_url, "https://chat.example.com");
        assert!(!settings.hydrate);
        assert_eq!(settings.ready_timeout_ms, 5_000);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_file(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_apply_and_invalid_values_are_ignored() {
        let mut settings = ClientSettings::default();
        apply_overrides_from(
            &mut settings,
            env(&[
                ("TIMELINE_BASE_URL", "https://other.example.com"),
                ("TIMELINE_BASE_PREFIX", "/chat"),
                ("TIMELINE_READY_TIMEOUT_MS", "2500"),
                ("TIMELINE_FETCH_TIMEOUT_MS", "forever"),
                ("TIMELINE_HYDRATE", "off"),
                ("TIMELINE_HISTORY_CAPACITY", "0"),
                ("TIMELINE_LOG_LEVEL", "shouty"),
            ]),
        );
        assert_eq!(settings.base_url, "https://other.example.com");
        assert_eq!(settings.base_prefix, "/chat");
        assert_eq!(settings.ready_timeout_ms, 2_500);
        assert_eq!(settings.fetch_timeout_ms, 10_000);
        assert!(!settings.hydrate);
        assert_eq!(settings.history_capacity, 0);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn out_of_range_env_values_are_ignored() {
        let mut settings = ClientSettings::default();
        apply_overrides_from(
            &mut settings,
            env(&[
                ("TIMELINE_READY_TIMEOUT_MS", "50"),
                ("TIMELINE_HISTORY_CAPACITY", "100001"),
            ]),
        );
        assert_eq!(settings.ready_timeout_ms, 5_000);
        assert_eq!(settings.history_capacity, DEFAULT_HISTORY_CAPACITY);
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn validate_rejects_bad_urls() {
        let mut settings = ClientSettings {
            base_url: "ftp://example.com".into(),
            ..ClientSettings::default()
        };
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
        settings.base_url = "http://example.com".into();
        settings.base_prefix = "chat".into();
        assert!(settings.validate().is_err());
        settings.base_prefix = "/chat".into();
        assert!(settings.validate().is_ok());
    }
}
