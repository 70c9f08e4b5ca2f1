//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ChatwireSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `CHATWIRE_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::ChatwireSettings;

/// Environment variable naming an explicit settings file.
pub const SETTINGS_PATH_ENV: &str = "CHATWIRE_SETTINGS";

/// Resolve the settings file: `$CHATWIRE_SETTINGS`, else
/// `~/.chatwire/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = std::env::var_os(SETTINGS_PATH_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".chatwire").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ChatwireSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid combination
/// of values is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ChatwireSettings> {
    let defaults = serde_json::to_value(ChatwireSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ChatwireSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CHATWIRE_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut ChatwireSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// - Integers must parse and fall within the documented range
/// - Booleans accept `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are logged and ignored (file/default value stays)
pub fn apply_overrides<F>(settings: &mut ChatwireSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("CHATWIRE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.number("CHATWIRE_PORT", 0_u16, u16::MAX) {
        settings.server.port = v;
    }
    if let Some(v) = env.number("CHATWIRE_MAX_REQUEST_SIZE", 1024_usize, 64 * 1024 * 1024) {
        settings.server.max_request_size = v;
    }
    if let Some(v) = env.number("CHATWIRE_MAX_FRAME_SIZE", 125_usize, 64 * 1024 * 1024) {
        settings.server.max_frame_size = v;
    }
    if let Some(v) = env.string("CHATWIRE_ALLOWED_ORIGINS") {
        settings.server.allowed_origins = parse_list(&v);
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = env.number("CHATWIRE_TOKEN_TTL_SECS", 1_u64, 365 * 24 * 60 * 60) {
        settings.auth.token_ttl_secs = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("CHATWIRE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("CHATWIRE_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `val` as a number in `min..=max`.
pub fn parse_in_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.trim().parse().ok().filter(|n| (min..=max).contains(n))
}

/// Split a comma-separated list, trimming entries and dropping empties.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn number<T>(&self, name: &str, min: T, max: T) -> Option<T>
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let val = (self.lookup)(name)?;
        let result = parse_in_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, %min, %max, "env var out of range or not a number, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use chatwire_core::logging::capture_logs;
    use tracing::Level;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "server": {"port": 8080, "host": "localhost"}
        });
        let source = serde_json::json!({
            "server": {"port": 9090}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"origins": ["a", "b", "c"]});
        let source = serde_json::json!({"origins": ["d"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["origins"], serde_json::json!(["d"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_new_keys_added() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"b": 2}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        let defaults = ChatwireSettings::default();
        assert_eq!(settings.server.read_chunk_size, defaults.server.read_chunk_size);
        assert_eq!(settings.auth.token_ttl_secs, defaults.auth.token_ttl_secs);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"maxFrameSize": 4096, "allowedOrigins": ["https://chat.example"]}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server.max_frame_size, 4096);
        assert_eq!(settings.server.allowed_origins, vec!["https://chat.example"]);
        assert_eq!(settings.server.read_chunk_size, 8192);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        assert_matches!(load_settings_from_path(&path), Err(SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_invalid_combination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"outboundQueueCapacity": 0}}"#).unwrap();

        assert_matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Invalid { field: "outboundQueueCapacity", .. })
        );
    }

    // ── apply_overrides ─────────────────────────────────────────────

    #[test]
    fn overrides_apply_to_every_section() {
        let mut settings = ChatwireSettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[
                ("CHATWIRE_HOST", "127.0.0.1"),
                ("CHATWIRE_PORT", "9000"),
                ("CHATWIRE_MAX_REQUEST_SIZE", "131072"),
                ("CHATWIRE_ALLOWED_ORIGINS", "https://a.test, https://b.test,"),
                ("CHATWIRE_TOKEN_TTL_SECS", "60"),
                ("CHATWIRE_LOG_LEVEL", "debug"),
                ("CHATWIRE_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.max_request_size, 131_072);
        assert_eq!(
            settings.server.allowed_origins,
            vec!["https://a.test", "https://b.test"]
        );
        assert_eq!(settings.auth.token_ttl_secs, 60);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_override_is_ignored_and_logged() {
        let (logs, _guard) = capture_logs();
        let mut settings = ChatwireSettings::default();
        apply_overrides(
            &mut settings,
            lookup_from(&[("CHATWIRE_PORT", "99999"), ("CHATWIRE_LOG_JSON", "maybe")]),
        );
        assert_eq!(settings.server.port, 8080);
        assert!(!settings.logging.json);
        assert_eq!(logs.at(Level::WARN).len(), 2);
        assert_eq!(logs.field_values("key"), vec!["CHATWIRE_PORT", "CHATWIRE_LOG_JSON"]);
    }

    #[test]
    fn empty_string_override_is_ignored() {
        let mut settings = ChatwireSettings::default();
        apply_overrides(&mut settings, lookup_from(&[("CHATWIRE_HOST", "")]));
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in &["true", "1", "yes", "on", "TRUE", "On"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in &["false", "0", "no", "off", "FALSE"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn parse_in_range_bounds() {
        assert_eq!(parse_in_range("0", 0_u16, u16::MAX), Some(0));
        assert_eq!(parse_in_range(" 65535 ", 1_u16, u16::MAX), Some(65535));
        assert_eq!(parse_in_range("0", 1_u16, u16::MAX), None);
        assert_eq!(parse_in_range::<u16>("99999", 1, u16::MAX), None);
        assert_eq!(parse_in_range::<u16>("port", 1, u16::MAX), None);
        assert_eq!(parse_in_range("2048", 1024_usize, 4096), Some(2048));
        assert_eq!(parse_in_range("512", 1024_usize, 4096), None);
        assert_eq!(parse_in_range::<u64>("-1", 0, 10), None);
    }

    #[test]
    fn parse_list_trims_and_drops_empties() {
        assert_eq!(parse_list(" a , ,b,"), vec!["a", "b"]);
        assert!(parse_list("").is_empty());
    }
}
