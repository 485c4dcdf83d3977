//! Application configuration management.
//!
//! Handles loading, saving, and accessing client configuration including the
//! chat server domain, connection tuning, credential/media paths, and logging
//! settings. Configuration is persisted as TOML on disk and passed into
//! constructors explicitly; no component mutates process-wide state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{WlError, WlResult};

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Persistent connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Media settings.
    #[serde(default)]
    pub media: MediaConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Persistent connection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Seconds between heartbeat pings on an idle connection.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Timeout for auth collaborator HTTP requests, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Handshake wait when opening the transport, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum initial-connect attempts before surfacing an error.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for reconnect backoff, in seconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Cap for reconnect backoff, in seconds.
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,

    /// Whether to reconnect automatically on unexpected transport loss.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// User-Agent header presented on the transport handshake.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Bound on joining each loop during disconnect, in seconds.
    #[serde(default = "default_loop_join_timeout")]
    pub loop_join_timeout_secs: u64,

    /// Consecutive unanswered pings before the connection is declared dead.
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Auth collaborator server domain (registration/login/logout).
    #[serde(default = "default_server")]
    pub server: String,

    /// Path to the persisted credentials file. If empty, uses default location.
    #[serde(default)]
    pub credentials_path: String,

    /// Protocol version reported at login.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

/// Media settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Directory where downloaded media is stored. If empty, uses default.
    #[serde(default)]
    pub media_dir: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for log files. If empty, uses default location.
    #[serde(default)]
    pub directory: String,

    /// Enable JSON structured logging output for files.
    #[serde(default)]
    pub json_output: bool,
}

// Default value functions for serde

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    15
}

fn default_connect_timeout() -> u64 {
    constants::CONN_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    constants::RETRY_MAX
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_reconnect_max_delay() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    format!("{}/{}", constants::APP_NAME, constants::APP_VERSION)
}

fn default_loop_join_timeout() -> u64 {
    2
}

fn default_max_missed_pongs() -> u32 {
    3
}

fn default_server() -> String {
    constants::DEFAULT_SERVER.to_string()
}

fn default_protocol_version() -> String {
    constants::PROTOCOL_VERSION.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_retries: default_max_retries(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            auto_reconnect: true,
            user_agent: default_user_agent(),
            loop_join_timeout_secs: default_loop_join_timeout(),
            max_missed_pongs: default_max_missed_pongs(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            credentials_path: String::new(),
            protocol_version: default_protocol_version(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            media_dir: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: String::new(),
            json_output: false,
        }
    }
}

impl ConnectionConfig {
    /// Heartbeat interval as a Duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Handshake wait as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reconnect backoff base as a Duration.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Reconnect backoff cap as a Duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_delay_secs)
    }

    /// Loop join bound as a Duration.
    pub fn loop_join_timeout(&self) -> Duration {
        Duration::from_secs(self.loop_join_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from the default config file path.
    pub fn load_default() -> WlResult<Self> {
        let path = Self::default_config_path()?;
        if path.exists() {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> WlResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a specific file path.
    pub fn save_to_file(&self, path: &Path) -> WlResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| WlError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> WlResult<PathBuf> {
        Ok(Self::data_dir()?.join("config.toml"))
    }

    /// Get the platform data directory for Waveline.
    pub fn data_dir() -> WlResult<PathBuf> {
        dirs::data_dir()
            .map(|d| d.join("waveline"))
            .ok_or_else(|| WlError::Config("no platform data directory".into()))
    }

    /// Get the effective credentials path, using the configured path or the default.
    pub fn effective_credentials_path(&self) -> WlResult<PathBuf> {
        if self.auth.credentials_path.is_empty() {
            Ok(Self::data_dir()?.join("credentials.json"))
        } else {
            Ok(PathBuf::from(&self.auth.credentials_path))
        }
    }

    /// Get the effective media directory, using the configured path or the default.
    pub fn effective_media_dir(&self) -> WlResult<PathBuf> {
        if self.media.media_dir.is_empty() {
            Ok(Self::data_dir()?.join("media"))
        } else {
            Ok(PathBuf::from(&self.media.media_dir))
        }
    }

    /// Get the effective log directory, using the configured path or the default.
    pub fn effective_log_dir(&self) -> WlResult<PathBuf> {
        if self.logging.directory.is_empty() {
            Ok(Self::data_dir()?.join("logs"))
        } else {
            Ok(PathBuf::from(&self.logging.directory))
        }
    }
}
