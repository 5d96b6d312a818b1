//! # relay-settings
//!
//! Settings are loaded from layers (in priority order, lowest first):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: `~/.relay/settings.json` or an explicit path (deep-merged over defaults)
//! 3. **Environment variables**: `RELAY_*` overrides
//!
//! Command-line flags are applied on top by the binary.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let settings = RelaySettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.sessions.buffer_capacity, 2048);
        assert_eq!(settings.sessions.ttl_secs, 600);
        assert_eq!(settings.sessions.idle_cancel_secs, 3600);
        assert_eq!(settings.sessions.max_sessions, 256);
        assert!(!settings.persistence.enabled);
        assert_eq!(settings.generator.kind, GeneratorKind::Echo);
    }
}
