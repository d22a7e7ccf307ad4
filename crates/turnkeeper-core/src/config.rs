//! Configuration management for turnkeeper
//!
//! Handles loading and validation of `turnkeeper.toml` configuration files.
//!
//! ```toml
//! [general]
//! log_level = "info"
//! log_format = "json"
//!
//! [scheduler]
//! reservation_ttl_secs = 180
//! active_ttl_secs = 900
//! settle_delay_ms = 0
//! notify_queue_moves = false
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TURNKEEPER_CONFIG";

const CONFIG_FILE_NAME: &str = "turnkeeper.toml";

/// Longest reservation window, session window or settle delay accepted.
pub const MAX_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Scheduler configuration (file form)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Window a granted requester has to start their session
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,

    /// Maximum length of a started session
    #[serde(default = "default_active_ttl_secs")]
    pub active_ttl_secs: u64,

    /// Delay between a session finishing and the next grant
    #[serde(default)]
    pub settle_delay_ms: u64,

    /// Tell queued requesters when they move up
    #[serde(default)]
    pub notify_queue_moves: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: default_reservation_ttl_secs(),
            active_ttl_secs: default_active_ttl_secs(),
            settle_delay_ms: 0,
            notify_queue_moves: false,
        }
    }
}

fn default_reservation_ttl_secs() -> u64 {
    180
}

fn default_active_ttl_secs() -> u64 {
    900
}

/// Validated scheduler settings shared by every tenant of a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerSettings {
    reservation_ttl: Duration,
    active_ttl: Duration,
    settle_delay: Duration,
    notify_queue_moves: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(default_reservation_ttl_secs()),
            active_ttl: Duration::from_secs(default_active_ttl_secs()),
            settle_delay: Duration::ZERO,
            notify_queue_moves: false,
        }
    }
}

impl SchedulerSettings {
    /// Build settings, rejecting zero TTLs, TTLs above [`MAX_WINDOW`] and a
    /// reservation window that is not strictly shorter than the session window.
    pub fn new(reservation_ttl: Duration, active_ttl: Duration) -> Result<Self, ConfigError> {
        if reservation_ttl.is_zero() || active_ttl.is_zero() {
            return Err(ConfigError::ValidationError(
                "reservation and active TTLs must be non-zero".to_string(),
            ));
        }
        check_window("reservation TTL", reservation_ttl)?;
        check_window("active TTL", active_ttl)?;
        if reservation_ttl >= active_ttl {
            return Err(ConfigError::ValidationError(format!(
                "reservation TTL ({}s) must be shorter than active TTL ({}s)",
                reservation_ttl.as_secs_f64(),
                active_ttl.as_secs_f64()
            )));
        }
        Ok(Self {
            reservation_ttl,
            active_ttl,
            settle_delay: Duration::ZERO,
            notify_queue_moves: false,
        })
    }

    /// Default settle delay applied by callers that do not pass their own.
    /// Capped at [`MAX_WINDOW`].
    #[must_use]
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay.min(MAX_WINDOW);
        self
    }

    #[must_use]
    pub fn with_queue_move_notices(mut self, enabled: bool) -> Self {
        self.notify_queue_moves = enabled;
        self
    }

    #[must_use]
    pub fn reservation_ttl(&self) -> Duration {
        self.reservation_ttl
    }

    #[must_use]
    pub fn active_ttl(&self) -> Duration {
        self.active_ttl
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    #[must_use]
    pub fn notify_queue_moves(&self) -> bool {
        self.notify_queue_moves
    }
}

impl TryFrom<&SchedulerConfig> for SchedulerSettings {
    type Error = ConfigError;

    fn try_from(config: &SchedulerConfig) -> Result<Self, Self::Error> {
        let settle_delay = Duration::from_millis(config.settle_delay_ms);
        check_window("settle delay", settle_delay)?;
        Ok(Self::new(
            Duration::from_secs(config.reservation_ttl_secs),
            Duration::from_secs(config.active_ttl_secs),
        )?
        .with_settle_delay(settle_delay)
        .with_queue_move_notices(config.notify_queue_moves))
    }
}

fn check_window(what: &str, window: Duration) -> Result<(), ConfigError> {
    if window > MAX_WINDOW {
        return Err(ConfigError::ValidationError(format!(
            "{what} ({}s) exceeds the {}s limit",
            window.as_secs(),
            MAX_WINDOW.as_secs()
        )));
    }
    Ok(())
}

/// Find the config file to load.
///
/// Order: explicit path, `$TURNKEEPER_CONFIG`, then
/// `<config_dir>/turnkeeper/turnkeeper.toml` if it exists.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir()
        .map(|dir| dir.join("turnkeeper").join(CONFIG_FILE_NAME))
        .filter(|path| path.exists())
}

impl Config {
    /// Load configuration from an explicit path or the default locations.
    ///
    /// Falls back to defaults when no file is found in the default locations.
    /// An explicit or environment-supplied path must exist.
    pub fn load(explicit: Option<&Path>) -> crate::Result<Self> {
        match resolve_config_path(explicit) {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::debug!("No config file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadFailed(path.display().to_string(), e.to_string())
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general
            .log_level
            .parse::<crate::logging::LogLevel>()
            .map_err(ConfigError::ValidationError)?;
        SchedulerSettings::try_from(&self.scheduler).map(|_| ())
    }

    /// Runtime scheduler settings
    pub fn scheduler_settings(&self) -> Result<SchedulerSettings, ConfigError> {
        SchedulerSettings::try_from(&self.scheduler)
    }

    /// Logging settings
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.general.log_level.clone(),
            format: self.general.log_format,
            file: self.general.log_file.clone(),
        }
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.scheduler.reservation_ttl_secs, 180);
        assert_eq!(config.scheduler.active_ttl_secs, 900);
        assert!(!config.scheduler.notify_queue_moves);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
            [scheduler]
            reservation_ttl_secs = 30
            settle_delay_ms = 2500
            "#,
        )
        .unwrap();
        let settings = config.scheduler_settings().unwrap();
        assert_eq!(settings.reservation_ttl(), Duration::from_secs(30));
        assert_eq!(settings.active_ttl(), Duration::from_secs(900));
        assert_eq!(settings.settle_delay(), Duration::from_millis(2500));
        assert_eq!(config.general.log_format, LogFormat::Pretty);
    }

    #[test]
    fn reservation_must_be_shorter_than_active() {
        let err = Config::from_toml_str(
            r#"
            [scheduler]
            reservation_ttl_secs = 900
            active_ttl_secs = 900
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be shorter"));
    }

    #[test]
    fn zero_ttl_rejected() {
        let err = SchedulerSettings::new(Duration::ZERO, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn oversized_windows_rejected() {
        let err = Config::from_toml_str(
            r#"
            [scheduler]
            reservation_ttl_secs = 9223372036854775806
            active_ttl_secs = 9223372036854775807
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds"));

        let err = Config::from_toml_str(
            r#"
            [scheduler]
            settle_delay_ms = 9223372036854775807
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("settle delay"));
    }

    #[test]
    fn window_limit_is_inclusive() {
        let settings = SchedulerSettings::new(MAX_WINDOW - Duration::from_secs(1), MAX_WINDOW)
            .unwrap()
            .with_settle_delay(Duration::MAX);
        assert_eq!(settings.active_ttl(), MAX_WINDOW);
        assert_eq!(settings.settle_delay(), MAX_WINDOW);

        let err =
            SchedulerSettings::new(Duration::from_secs(1), MAX_WINDOW + Duration::from_secs(1))
                .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn bad_log_level_rejected() {
        let err = Config::from_toml_str(
            r#"
            [general]
            log_level = "loud"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown log level"));
    }

    #[test]
    fn json_log_format_parses() {
        let config = Config::from_toml_str(
            r#"
            [general]
            log_format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.log_config().format, LogFormat::Json);
    }

    #[test]
    fn load_from_missing_path_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn load_from_reads_file_and_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turnkeeper.toml");
        std::fs::write(
            &path,
            "[scheduler]\nreservation_ttl_secs = 60\nactive_ttl_secs = 600\n",
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.active_ttl_secs, 600);

        let text = config.to_toml_string().unwrap();
        let again = Config::from_toml_str(&text).unwrap();
        assert_eq!(again.scheduler.reservation_ttl_secs, 60);
    }
}
