//! Settings type definitions.
//!
//! Field names are camelCase in JSON. Every section implements [`Default`] and
//! is `#[serde(default)]`, so partial files are accepted.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub server: ServerSettings,
    pub sessions: SessionSettings,
    pub persistence: PersistenceSettings,
    pub generator: GeneratorSettings,
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.sessions.buffer_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "sessions.bufferCapacity must be at least 1".into(),
            ));
        }
        if self.sessions.max_sessions == 0 {
            return Err(SettingsError::InvalidValue(
                "sessions.maxSessions must be at least 1".into(),
            ));
        }
        if self.sessions.gc_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "sessions.gcIntervalSecs must be at least 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.generator.default_temperature) {
            return Err(SettingsError::InvalidValue(format!(
                "generator.defaultTemperature {} outside 0..=2",
                self.generator.default_temperature
            )));
        }
        if self.generator.kind == GeneratorKind::Upstream
            && self.generator.upstream_url.as_deref().unwrap_or("").is_empty()
        {
            return Err(SettingsError::InvalidValue(
                "generator.upstreamUrl is required for the upstream generator".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    pub port: u16,
    /// SSE keep-alive comment interval.
    pub keep_alive_secs: u64,
    /// Timeout for non-streaming requests.
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            keep_alive_secs: 15,
            request_timeout_secs: 300,
        }
    }
}

/// Session registry and buffer settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Events retained in memory per session.
    pub buffer_capacity: usize,
    /// How long a finished session stays resumable.
    pub ttl_secs: u64,
    /// Cancel generation after this long with no listener. 0 disables.
    pub idle_cancel_secs: u64,
    pub gc_interval_secs: u64,
    pub max_sessions: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 2048,
            ttl_secs: 600,
            idle_cancel_secs: 3600,
            gc_interval_secs: 30,
            max_sessions: 256,
        }
    }
}

impl SessionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn idle_cancel(&self) -> Option<Duration> {
        (self.idle_cancel_secs > 0).then(|| Duration::from_secs(self.idle_cancel_secs))
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

/// Durable replica settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub db_path: PathBuf,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: PathBuf::from("sessions.db"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    #[default]
    Echo,
    Upstream,
}

impl std::str::FromStr for GeneratorKind {
    type Err = SettingsError;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "echo" => Ok(Self::Echo),
            "upstream" => Ok(Self::Upstream),
            other => Err(SettingsError::InvalidValue(format!(
                "unknown generator kind: {other}"
            ))),
        }
    }
}

/// Which generation engine to run and its request defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneratorSettings {
    pub kind: GeneratorKind,
    /// Model label reported to clients (and sent upstream).
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Pause between echo fragments.
    pub fragment_delay_ms: u64,
    pub default_max_tokens: u32,
    pub default_temperature: f64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            kind: GeneratorKind::Echo,
            model: "relay-echo".to_string(),
            upstream_url: None,
            api_key: None,
            fragment_delay_ms: 20,
            default_max_tokens: 4096,
            default_temperature: 0.7,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}
