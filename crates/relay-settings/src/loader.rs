//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::RelaySettings;

/// Resolve the default settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

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

/// Apply `RELAY_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Each variable has strict parsing rules:
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are ignored (fall back to file/default) with a warning
pub fn apply_overrides_from<F>(settings: &mut RelaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("RELAY_PORT", 1, 65535) {
        settings.server.port = v;
    }

    // ── Sessions ────────────────────────────────────────────────────
    if let Some(v) = env.usize("RELAY_BUFFER_CAPACITY", 1, 1_000_000) {
        settings.sessions.buffer_capacity = v;
    }
    if let Some(v) = env.u64("RELAY_SESSION_TTL_SECS", 0, 604_800) {
        settings.sessions.ttl_secs = v;
    }
    if let Some(v) = env.u64("RELAY_CANCEL_AFTER_DISCONNECT_SECS", 0, 604_800) {
        settings.sessions.idle_cancel_secs = v;
    }
    if let Some(v) = env.u64("RELAY_GC_INTERVAL_SECS", 1, 86_400) {
        settings.sessions.gc_interval_secs = v;
    }
    if let Some(v) = env.usize("RELAY_MAX_SESSIONS", 1, 1_000_000) {
        settings.sessions.max_sessions = v;
    }

    // ── Persistence ─────────────────────────────────────────────────
    if let Some(v) = env.bool("RELAY_PERSIST_SESSIONS") {
        settings.persistence.enabled = v;
    }
    if let Some(v) = env.string("RELAY_SESSIONS_DB_PATH") {
        settings.persistence.db_path = PathBuf::from(v);
    }

    // ── Generator ───────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_GENERATOR") {
        match v.parse() {
            Ok(kind) => settings.generator.kind = kind,
            Err(_) => tracing::warn!(key = "RELAY_GENERATOR", value = %v, "invalid generator env var, ignoring"),
        }
    }
    if let Some(v) = env.string("RELAY_MODEL") {
        settings.generator.model = v;
    }
    if let Some(v) = env.string("RELAY_UPSTREAM_URL") {
        settings.generator.upstream_url = Some(v);
    }
    if let Some(v) = env.string("RELAY_UPSTREAM_API_KEY") {
        settings.generator.api_key = Some(v);
    }
    if let Some(v) = env.u64("RELAY_MAX_TOKENS", 1, u64::from(u32::MAX)) {
        settings.generator.default_max_tokens = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = env.f64("RELAY_TEMPERATURE", 0.0, 2.0) {
        settings.generator.default_temperature = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("RELAY_LOG_FORMAT") {
        settings.logging.format = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_f64_range(val: &str, min: f64, max: f64) -> Option<f64> {
    let n: f64 = val.trim().parse().ok()?;
    (n.is_finite() && n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }

    fn f64(&self, name: &str, min: f64, max: f64) -> Option<f64> {
        self.parsed(name, "f64", |v| parse_f64_range(v, min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::errors::SettingsError;
    use crate::types::GeneratorKind;

    fn with_env(vars: &[(&str, &str)]) -> RelaySettings {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut settings = RelaySettings::default();
        apply_overrides_from(&mut settings, |name| map.get(name).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 3000, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
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
    fn merge_array_and_primitive_replace() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3], "a": {"nested": true}}),
            serde_json::json!({"items": [4], "a": 42}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
        assert_eq!(merged["a"], 42);
    }

    // ── load_file_layer ─────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = load_file_layer(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, 3000);
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"sessions": {"bufferCapacity": 16}, "persistence": {"enabled": true}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.sessions.buffer_capacity, 16);
        assert_eq!(settings.sessions.ttl_secs, 600);
        assert!(settings.persistence.enabled);
        assert_eq!(settings.persistence.db_path, PathBuf::from("sessions.db"));
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(load_file_layer(&path), Err(SettingsError::Json(_))));
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let s = with_env(&[
            ("RELAY_PORT", "8088"),
            ("RELAY_BUFFER_CAPACITY", "3"),
            ("RELAY_CANCEL_AFTER_DISCONNECT_SECS", "0"),
            ("RELAY_PERSIST_SESSIONS", "yes"),
            ("RELAY_SESSIONS_DB_PATH", "/var/lib/relay/s.db"),
            ("RELAY_GENERATOR", "upstream"),
            ("RELAY_UPSTREAM_URL", "http://gpu:8000"),
            ("RELAY_TEMPERATURE", "0.2"),
        ]);
        assert_eq!(s.server.port, 8088);
        assert_eq!(s.sessions.buffer_capacity, 3);
        assert_eq!(s.sessions.idle_cancel(), None);
        assert!(s.persistence.enabled);
        assert_eq!(s.persistence.db_path, PathBuf::from("/var/lib/relay/s.db"));
        assert_eq!(s.generator.kind, GeneratorKind::Upstream);
        assert_eq!(s.generator.upstream_url.as_deref(), Some("http://gpu:8000"));
        assert!((s.generator.default_temperature - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let s = with_env(&[
            ("RELAY_PORT", "0"),
            ("RELAY_BUFFER_CAPACITY", "lots"),
            ("RELAY_PERSIST_SESSIONS", "maybe"),
            ("RELAY_GENERATOR", "llama"),
            ("RELAY_TEMPERATURE", "9"),
            ("RELAY_HOST", ""),
        ]);
        let d = RelaySettings::default();
        assert_eq!(s.server.port, d.server.port);
        assert_eq!(s.server.host, d.server.host);
        assert_eq!(s.sessions.buffer_capacity, d.sessions.buffer_capacity);
        assert!(!s.persistence.enabled);
        assert_eq!(s.generator.kind, GeneratorKind::Echo);
        assert!((s.generator.default_temperature - 0.7).abs() < f64::EPSILON);
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parsers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_u64_range(" 42 ", 0, 100), Some(42));
        assert_eq!(parse_usize_range("0", 1, 10), None);
        assert_eq!(parse_f64_range("NaN", 0.0, 2.0), None);
    }
}
