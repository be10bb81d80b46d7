//! Configuration for the textwire server binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over defaults.
//!
//! The `[pool]` section is not used by the server itself. It is resolved
//! into [`Config::pool`] for applications that embed a [`Client`] next to
//! the server and want one file for both.
//!
//! [`Client`]: crate::client::Client

use crate::pool::PoolConfig;
use crate::protocol::DEFAULT_MAX_PAYLOAD;
use crate::runtime::RuntimeType;
use crate::server::DEFAULT_DISCONNECT_COMMAND;
use clap::Parser;
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "textwire-server")]
#[command(version)]
#[command(about = "Line-oriented text protocol server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:11311)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Scheduling model for connections
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Number of worker threads for the evented runtime (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Command that ends a session
    #[arg(long)]
    pub disconnect_command: Option<String>,

    /// Largest payload a request may declare, in bytes
    #[arg(long)]
    pub max_payload: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub runtime: RuntimeType,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_disconnect_command")]
    pub disconnect_command: String,
    /// Largest payload a request may declare, in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            runtime: RuntimeType::default(),
            workers: None,
            disconnect_command: default_disconnect_command(),
            max_payload: default_max_payload(),
        }
    }
}

/// Client pool settings, in whole seconds except the connect timeout.
#[derive(Debug, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout: default_idle_timeout(),
            connect_timeout_ms: default_connect_timeout_ms(),
            check_interval: default_check_interval(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

impl From<&PoolSection> for PoolConfig {
    fn from(section: &PoolSection) -> Self {
        PoolConfig {
            max_connections: section.max_connections,
            idle_timeout: Duration::from_secs(section.idle_timeout),
            connect_timeout: Duration::from_millis(section.connect_timeout_ms),
            check_interval: Duration::from_secs(section.check_interval),
            cleanup_interval: Duration::from_secs(section.cleanup_interval),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:11311".to_string()
}

fn default_disconnect_command() -> String {
    DEFAULT_DISCONNECT_COMMAND.to_string()
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

fn default_max_connections() -> usize {
    100
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_check_interval() -> u64 {
    10
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub runtime: RuntimeType,
    pub workers: Option<usize>,
    pub disconnect_command: String,
    pub max_payload: usize,
    /// Client pool settings from `[pool]`; unused by the server binary.
    pub pool: PoolConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve `cli` against the TOML file it names, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|source| ConfigError::InvalidListen { listen, source })?;

        Ok(Config {
            listen,
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            workers: cli.workers.or(toml_config.server.workers),
            disconnect_command: cli
                .disconnect_command
                .unwrap_or(toml_config.server.disconnect_command),
            max_payload: cli.max_payload.unwrap_or(toml_config.server.max_payload),
            pool: PoolConfig::from(&toml_config.pool),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid listen address '{listen}': {source}")]
    InvalidListen {
        listen: String,
        source: AddrParseError,
    },
}
