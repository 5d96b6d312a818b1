use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Output encoding for log lines on stdout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = TelemetryError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(TelemetryError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("unknown log format: {0}")]
    UnknownFormat(String),
    #[error("unknown log level: {0}")]
    UnknownLevel(String),
    #[error("telemetry already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "relay_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
        }
    }
}

impl TelemetryConfig {
    /// Build from the string forms used in settings files.
    pub fn from_strings(level: &str, format: &str) -> Result<Self, TelemetryError> {
        Ok(Self {
            log_level: parse_level(level)?,
            module_levels: Vec::new(),
            format: format.parse()?,
        })
    }

    /// The `EnvFilter` directive equivalent of this config.
    pub fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

pub fn parse_level(raw: &str) -> Result<Level, TelemetryError> {
    raw.trim()
        .parse::<Level>()
        .map_err(|_| TelemetryError::UnknownLevel(raw.to_string()))
}

/// Handle returned by [`init_telemetry`]; records what was installed.
#[derive(Debug)]
pub struct TelemetryGuard {
    directive: String,
    format: LogFormat,
}

impl TelemetryGuard {
    /// The filter in effect (RUST_LOG wins over the configured level).
    pub fn directive(&self) -> &str {
        &self.directive
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }
}

/// Initialize the global tracing subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let directive = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| config.filter_directive());
    let env_filter = EnvFilter::try_new(&directive)
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    Ok(TelemetryGuard {
        directive,
        format: config.format,
    })
}
