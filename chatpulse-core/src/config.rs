//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/chatpulse/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/chatpulse/` (~/.config/chatpulse/)
//! - Data: `$XDG_DATA_HOME/chatpulse/` (~/.local/share/chatpulse/)
//! - State/Logs: `$XDG_STATE_HOME/chatpulse/` (~/.local/state/chatpulse/)

use crate::error::{Error, Result};
use crate::types::{SubjectAreaSettings, Timezone};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Aggregation and reporting configuration
    #[serde(default)]
    pub analytics: AnalyticsConfig,

    /// Defaults applied to subject areas seen for the first time
    #[serde(default)]
    pub defaults: SettingsDefaults,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Aggregation and reporting configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    /// Intent display names treated as "did not understand"
    #[serde(default = "default_fallback_intents")]
    pub fallback_intents: Vec<String>,

    /// Reserved subject area that records top-level entry events
    #[serde(default = "default_general_subject_area")]
    pub general_subject_area: String,

    /// Subject areas merged by the total view.
    ///
    /// When empty, every subject area with stored settings is used.
    #[serde(default)]
    pub subject_areas: Vec<String>,

    /// Raw intent name -> display name used when merging across areas
    #[serde(default = "default_intent_renames")]
    pub intent_renames: HashMap<String, String>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            fallback_intents: default_fallback_intents(),
            general_subject_area: default_general_subject_area(),
            subject_areas: vec![],
            intent_renames: default_intent_renames(),
        }
    }
}

impl AnalyticsConfig {
    /// Whether the given intent name is one of the fallback intents
    pub fn is_fallback_intent(&self, intent_name: &str) -> bool {
        self.fallback_intents.iter().any(|f| f == intent_name)
    }
}

fn default_fallback_intents() -> Vec<String> {
    vec!["Default Fallback Intent".to_string()]
}

fn default_general_subject_area() -> String {
    "general".to_string()
}

fn default_intent_renames() -> HashMap<String, String> {
    HashMap::from([
        (
            "Default Welcome Intent".to_string(),
            "welcome-home".to_string(),
        ),
        (
            "Default Fallback Intent".to_string(),
            "no-content".to_string(),
        ),
    ])
}

/// Settings written for a subject area the first time it is referenced
#[derive(Debug, Deserialize, Clone)]
pub struct SettingsDefaults {
    #[serde(default = "default_primary_color")]
    pub primary_color: String,

    #[serde(default = "default_timezone_name")]
    pub timezone_name: String,

    /// Fixed UTC offset in hours (may be fractional, e.g. 5.5)
    #[serde(default = "default_timezone_offset_hours")]
    pub timezone_offset_hours: f64,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        Self {
            primary_color: default_primary_color(),
            timezone_name: default_timezone_name(),
            timezone_offset_hours: default_timezone_offset_hours(),
        }
    }
}

impl SettingsDefaults {
    /// Build the settings document stored for a new subject area
    pub fn to_settings(&self) -> SubjectAreaSettings {
        SubjectAreaSettings {
            primary_color: self.primary_color.clone(),
            timezone: Timezone {
                name: self.timezone_name.clone(),
                offset_hours: self.timezone_offset_hours,
            },
        }
    }
}

fn default_primary_color() -> String {
    "#6497AD".to_string()
}

fn default_timezone_name() -> String {
    "(UTC-07:00) Pacific Time (US & Canada)".to_string()
}

fn default_timezone_offset_hours() -> f64 {
    -7.0
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Level for per-turn ingest events (`chatpulse_core::ingest`).
    ///
    /// Unset follows `level`. Turn and conversation updates are logged at
    /// debug, so a batch ingest at `debug` writes several lines per event.
    #[serde(default)]
    pub ingest_level: Option<String>,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ingest_level: None,
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.analytics.general_subject_area.trim().is_empty() {
            return Err(Error::Config(
                "analytics.general_subject_area must not be empty".to_string(),
            ));
        }
        let offset = self.defaults.timezone_offset_hours;
        if !offset.is_finite() || offset.abs() >= 24.0 {
            return Err(Error::Config(format!(
                "defaults.timezone_offset_hours must be within (-24, 24), got {}",
                offset
            )));
        }
        crate::logging::build_filter(&self.logging)?;
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/chatpulse/config.toml` (~/.config/chatpulse/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("chatpulse").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/chatpulse/` (~/.local/share/chatpulse/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("chatpulse")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/chatpulse/` (~/.local/state/chatpulse/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("chatpulse")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/chatpulse/metrics.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("metrics.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/chatpulse/chatpulse.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("chatpulse.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
