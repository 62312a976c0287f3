//! Client settings kept in `config.toml`.
//!
//! The file lives in `rws-client/` under the platform config directory
//! (`RwsClient/` on Windows and macOS).  `--config` on the command line
//! overrides the location.  Anything absent from the file (or the file
//! itself) falls back to its default.  A complete file:
//!
//! ```toml
//! [connection]
//! url = "ws://localhost:3211?authkey=TRTmrt"
//! subprotocols = ["jsonRWS"]
//! question_timeout_ms = 3000
//! reconnect_attempts = 5
//! reconnect_delay_ms = 3000
//!
//! [logging]
//! log_level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rws_core::protocol::SUBPROTOCOL_JSON_RWS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config directory for this platform (set --config)")]
    NoPlatformConfigDir,

    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot encode config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Contents of `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The `[connection]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// `ws://host[:port][/path][?query]` of the relay.
    #[serde(default = "default_url")]
    pub url: String,
    /// Subprotocols offered in `Sec-WebSocket-Protocol`, in preference order.
    #[serde(default = "default_subprotocols")]
    pub subprotocols: Vec<String>,
    /// How long `question()` waits for an answer.
    #[serde(default = "default_question_timeout_ms")]
    pub question_timeout_ms: u64,
    /// Maximum reconnect attempts after the connection drops.  `0` disables
    /// reconnection.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// Pause before each reconnect attempt.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl ConnectionConfig {
    pub fn question_timeout(&self) -> Duration {
        Duration::from_millis(self.question_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// The `[logging]` section.  `RUST_LOG` wins when set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Fallback `EnvFilter` directive, e.g. `"info"` or `"rws_client=debug"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_url() -> String {
    "ws://localhost:3211".to_string()
}
fn default_subprotocols() -> Vec<String> {
    vec![SUBPROTOCOL_JSON_RWS.to_string()]
}
fn default_question_timeout_ms() -> u64 {
    3_000
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    3_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            subprotocols: default_subprotocols(),
            question_timeout_ms: default_question_timeout_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// `config.toml` inside the platform config directory.
///
/// # Errors
///
/// [`ConfigError::NoPlatformConfigDir`] when neither the platform variable
/// nor `HOME` is set.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    let dir = platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)?;
    Ok(dir.join("config.toml"))
}

/// [`load_config_from`] on [`config_file_path`].
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Reads `path`.  A file that does not exist yields the defaults.
///
/// # Errors
///
/// [`ConfigError::Io`] when the file exists but cannot be read,
/// [`ConfigError::Parse`] when it is not valid TOML for [`ClientConfig`].
pub fn load_config_from(path: &Path) -> Result<ClientConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClientConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// [`save_config_to`] on [`config_file_path`].
///
/// # Errors
///
/// See [`save_config_to`].
pub fn save_config(config: &ClientConfig) -> Result<(), ConfigError> {
    save_config_to(config, &config_file_path()?)
}

/// Writes `config` to `path`, creating missing parent directories.
///
/// # Errors
///
/// [`ConfigError::Io`] or [`ConfigError::Serialize`].
pub fn save_config_to(config: &ClientConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("RwsClient"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("rws-client"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("RwsClient"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
