//! Logging setup
//!
//! Logs go to stderr so that the stdout backend keeps a clean stream.
//! `RUST_LOG` takes precedence over `log-level`.

use sitrep_core::config::{LOG_FORMAT, LOG_LEVEL};
use sitrep_core::{ConfigError, ConfigKind, ConfigRegistry};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: u64,
    pub format: LogFormat,
}

impl LogSettings {
    /// Read `log-level` and `log-format`
    ///
    /// # Errors
    /// Returns `InvalidValue` for an unknown log format or a level above 5.
    pub fn from_config(config: &ConfigRegistry) -> Result<Self, ConfigError> {
        let raw: String = config.get(LOG_FORMAT)?;
        let format = match raw.to_ascii_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: LOG_FORMAT.to_string(),
                    kind: ConfigKind::String,
                    value: raw,
                });
            }
        };
        let level: u64 = config.get(LOG_LEVEL)?;
        if level > 5 {
            return Err(ConfigError::InvalidValue {
                key: LOG_LEVEL.to_string(),
                kind: ConfigKind::Uint,
                value: level.to_string(),
            });
        }
        Ok(Self { level, format })
    }

    /// Filter directive for the numeric level (0 panic .. 5 debug)
    #[must_use]
    pub fn directive(&self) -> &'static str {
        match self.level {
            0..=2 => "error",
            3 => "warn",
            4 => "info",
            _ => "debug",
        }
    }
}

/// Install the global subscriber
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init(settings: LogSettings) -> eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.directive()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match settings.format {
        LogFormat::Text => builder.with_target(false).try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| eyre::eyre!("cannot install log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitrep_core::define_core_keys;

    #[test]
    fn test_settings_from_config() {
        let mut config = ConfigRegistry::new();
        define_core_keys(&mut config).unwrap();
        let settings = LogSettings::from_config(&config).unwrap();
        assert_eq!(settings.format, LogFormat::Text);
        assert_eq!(settings.directive(), "info");

        config.set(LOG_LEVEL, 5u64).unwrap();
        config.set(LOG_FORMAT, "JSON").unwrap();
        let settings = LogSettings::from_config(&config).unwrap();
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.directive(), "debug");

        config.set(LOG_FORMAT, "logfmt").unwrap();
        assert!(LogSettings::from_config(&config).is_err());
    }

    #[test]
    fn test_level_above_debug_rejected() {
        let mut config = ConfigRegistry::new();
        define_core_keys(&mut config).unwrap();
        config.set(LOG_LEVEL, 6u64).unwrap();
        let err = LogSettings::from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == LOG_LEVEL));
    }

    #[test]
    fn test_directive_levels() {
        let directive = |level| {
            LogSettings {
                level,
                format: LogFormat::Text,
            }
            .directive()
        };
        assert_eq!(directive(0), "error");
        assert_eq!(directive(2), "error");
        assert_eq!(directive(3), "warn");
        assert_eq!(directive(4), "info");
        assert_eq!(directive(5), "debug");
    }
}
