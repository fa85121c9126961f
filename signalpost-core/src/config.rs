//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/signalpost/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/signalpost/` (~/.config/signalpost/)
//! - Data: `$XDG_DATA_HOME/signalpost/` (~/.local/share/signalpost/)
//! - State/Logs: `$XDG_STATE_HOME/signalpost/` (~/.local/state/signalpost/)
//!
//! The file-backed [`Config`] is read once at startup. The values that can
//! change while the pipeline runs (default user, session id, test mode) live
//! in a [`SettingsHandle`], an atomically swapped snapshot that the enqueue
//! and delivery paths read without locking.

use crate::error::{Error, Result};
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default ingestion service
pub const DEFAULT_BASE_URL: &str = "https://nom.telemetrydeck.com";

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
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Signal pipeline configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
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

/// Signal pipeline configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    /// App ID assigned by the ingestion service (UUID)
    pub app_id: Option<String>,

    /// Ingestion service base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// User identifier hashed into signals that don't name a user
    pub default_user: Option<String>,

    /// Force test mode on or off; unset follows the build profile
    pub test_mode: Option<bool>,

    /// Seconds between delivery attempts
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Seconds to wait for in-flight sends at shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Back up undelivered signals to disk at shutdown
    #[serde(default = "default_true")]
    pub persist_cache: bool,

    /// Override for the offline cache file
    pub cache_path: Option<PathBuf>,

    /// Send a "newSessionBegan" signal whenever the session rotates
    #[serde(default = "default_true")]
    pub send_new_session_began_signal: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            base_url: default_base_url(),
            default_user: None,
            test_mode: None,
            flush_interval_secs: default_flush_interval(),
            timeout_secs: default_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            persist_cache: true,
            cache_path: None,
            send_new_session_began_signal: true,
        }
    }
}

impl TelemetryConfig {
    /// Create a config for an app with all other fields defaulted
    pub fn for_app(app_id: impl Into<String>) -> Self {
        Self {
            app_id: Some(app_id.into()),
            ..Default::default()
        }
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let app_id = self
            .app_id
            .as_deref()
            .ok_or_else(|| Error::Config("telemetry.app_id is required".to_string()))?;

        Uuid::parse_str(app_id).map_err(|e| {
            Error::Config(format!("telemetry.app_id must be a UUID: {}", e))
        })?;

        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(Error::Config(
                "telemetry.base_url must start with http:// or https://".to_string(),
            ));
        }
        if self.flush_interval_secs == 0 {
            return Err(Error::Config(
                "telemetry.flush_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Test mode after applying the override
    pub fn effective_test_mode(&self) -> bool {
        resolve_test_mode(self.test_mode)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Offline cache file, honoring the override
    pub fn resolved_cache_path(&self) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(Config::cache_path)
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_flush_interval() -> u64 {
    10
}

fn default_timeout() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
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

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/signalpost/config.toml` (~/.config/signalpost/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("signalpost").join("config.toml")
    }

    /// Returns the data directory path (for the offline cache)
    ///
    /// `$XDG_DATA_HOME/signalpost/` (~/.local/share/signalpost/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("signalpost")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/signalpost/` (~/.local/state/signalpost/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("signalpost")
    }

    /// Returns the default offline cache file path
    ///
    /// `$XDG_DATA_HOME/signalpost/signal-cache.json`
    pub fn cache_path() -> PathBuf {
        Self::data_dir().join("signal-cache.json")
    }
}

/// The values signals are stamped with, as of one moment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySettings {
    pub app_id: String,
    pub base_url: String,
    pub default_user: Option<String>,
    pub session_id: String,
    pub test_mode_override: Option<bool>,
}

impl TelemetrySettings {
    /// Build initial settings from a validated config, with a fresh session
    pub fn from_config(config: &TelemetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            app_id: config.app_id.clone().unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_user: config.default_user.clone(),
            session_id: new_session_id(),
            test_mode_override: config.test_mode,
        })
    }

    pub fn is_test_mode(&self) -> bool {
        resolve_test_mode(self.test_mode_override)
    }

    /// Identifier to hash when a signal doesn't name a user
    ///
    /// Without a configured default user, falls back to a host-derived
    /// identifier so signals from one machine still group together.
    pub fn default_user_identifier(&self) -> String {
        self.default_user.clone().unwrap_or_else(|| {
            format!(
                "unknown user {} {} {}",
                std::env::consts::OS,
                std::env::consts::ARCH,
                home_dir().display()
            )
        })
    }
}

/// Debug builds report as test mode unless overridden
fn resolve_test_mode(test_mode: Option<bool>) -> bool {
    test_mode.unwrap_or(cfg!(debug_assertions))
}

fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Shared, atomically replaceable settings snapshot
///
/// Readers get a consistent `Arc<TelemetrySettings>`; writers publish a
/// modified copy. Cloning the handle shares the same snapshot.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<ArcSwap<TelemetrySettings>>,
}

impl SettingsHandle {
    pub fn new(settings: TelemetrySettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<TelemetrySettings> {
        self.inner.load_full()
    }

    /// Publish a modified copy of the settings
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&mut TelemetrySettings),
    {
        self.inner.rcu(|current| {
            let mut next = TelemetrySettings::clone(current);
            f(&mut next);
            next
        });
    }

    pub fn set_default_user(&self, user: Option<String>) {
        self.update(|s| s.default_user = user.clone());
    }

    pub fn set_test_mode(&self, test_mode: Option<bool>) {
        self.update(|s| s.test_mode_override = test_mode);
    }

    /// Start a new session, returning its id
    pub fn rotate_session(&self) -> String {
        let session_id = new_session_id();
        self.update(|s| s.session_id = session_id.clone());
        session_id
    }
}
