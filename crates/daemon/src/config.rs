//! Configuration management for the webterm daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/webterm/config.toml`.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SpawnParams;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("bind_address must be an IP address, got {0}")]
    InvalidBindAddress(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("default_cwd is not a directory: {0}")]
    InvalidWorkingDirectory(PathBuf),

    #[error("static_dir is not a directory: {0}")]
    InvalidStaticDir(PathBuf),

    #[error("terminal size must be at least 1x1, got {0}x{1}")]
    InvalidTerminalSize(u16, u16),

    #[error("{0} must be greater than 0")]
    ZeroLimit(&'static str),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the webterm daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Session defaults and limits.
    pub session: SessionConfig,

    /// Output and input stream limits.
    pub stream: StreamConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_address: String,

    /// Port to listen on. 0 picks a free port.
    pub port: u16,

    /// Directory of static assets served for unmatched paths.
    pub static_dir: Option<PathBuf>,
}

/// Session defaults and limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell to spawn for new sessions.
    pub default_shell: String,

    /// Working directory for sessions that don't request one.
    pub default_cwd: PathBuf,

    /// Value of `TERM` in the shell's environment.
    pub term: String,

    /// Default terminal columns.
    pub cols: u16,

    /// Default terminal rows.
    pub rows: u16,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Sessions with no consumers and no I/O for this long are removed (0 = never).
    pub idle_timeout_secs: u64,

    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,

    /// How long an exited session stays registered while consumers drain output.
    pub exit_grace_ms: u64,
}

/// Output and input stream limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Chunks buffered per consumer before the oldest are dropped.
    pub queue_chunks: usize,

    /// Bytes buffered per consumer before the oldest chunks are dropped.
    pub queue_bytes: usize,

    /// Buffer size for PTY reads.
    pub read_buffer_size: usize,

    /// Largest accepted input payload in bytes.
    pub max_input_bytes: usize,

    /// Reject input that is not valid UTF-8.
    pub require_utf8: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 3000,
            static_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_cwd: default_cwd(),
            term: "xterm-color".to_string(),
            cols: 80,
            rows: 30,
            max_sessions: 64,
            idle_timeout_secs: 0,
            sweep_interval_secs: 60,
            exit_grace_ms: 500,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_chunks: 256,
            queue_bytes: 1024 * 1024,
            read_buffer_size: 4096,
            max_input_bytes: 64 * 1024,
            require_utf8: false,
        }
    }
}

impl SessionConfig {
    /// Builds spawn parameters from the configured defaults.
    pub fn spawn_params(&self) -> SpawnParams {
        SpawnParams::new(&self.default_shell, &self.default_cwd)
            .with_size(self.cols, self.rows)
            .with_env("TERM", &self.term)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("webterm")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL")
            .ok()
            .filter(|shell| !shell.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Returns the user's home directory, or the temp directory without one.
fn default_cwd() -> PathBuf {
    dirs::home_dir()
        .filter(|home| home.is_dir())
        .unwrap_or_else(std::env::temp_dir)
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PORT: Listening port
    /// - WEBTERM_PORT: Listening port, wins over PORT
    /// - WEBTERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - WEBTERM_SHELL: Override the default shell
    pub fn apply_env_overrides(&mut self) {
        for var in ["PORT", "WEBTERM_PORT"] {
            if let Some(value) = non_empty_var(var) {
                match value.parse::<u16>() {
                    Ok(port) => {
                        tracing::info!("Overriding port from {}: {}", var, port);
                        self.server.port = port;
                    }
                    Err(_) => tracing::warn!("Ignoring invalid {} value: {}", var, value),
                }
            }
        }

        if let Some(level) = non_empty_var("WEBTERM_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(shell) = non_empty_var("WEBTERM_SHELL") {
            tracing::info!("Overriding default_shell from environment: {}", shell);
            self.session.default_shell = shell;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.server.bind_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(
                self.server.bind_address.clone(),
            ));
        }

        let shell_path = Path::new(&self.session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        if !self.session.default_cwd.is_dir() {
            return Err(ConfigError::InvalidWorkingDirectory(
                self.session.default_cwd.clone(),
            ));
        }

        if let Some(dir) = &self.server.static_dir {
            if !dir.is_dir() {
                return Err(ConfigError::InvalidStaticDir(dir.clone()));
            }
        }

        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize(
                self.session.cols,
                self.session.rows,
            ));
        }

        let limits = [
            ("queue_chunks", self.stream.queue_chunks),
            ("queue_bytes", self.stream.queue_bytes),
            ("read_buffer_size", self.stream.read_buffer_size),
            ("max_input_bytes", self.stream.max_input_bytes),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroLimit(name));
        }
        if self.session.idle_timeout_secs > 0 && self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::ZeroLimit("sweep_interval_secs"));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Returns the socket address the server binds to.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind_address))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
