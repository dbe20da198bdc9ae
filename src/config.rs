//! Configuration module for packet-log.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments for the packet log server
#[derive(Parser, Debug)]
#[command(name = "packet-log")]
#[command(author = "packet-log authors")]
#[command(version = "0.1.0")]
#[command(about = "Appends newline-delimited packets to a shared log and replies with the log", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog passed to listen(2)
    #[arg(long)]
    pub backlog: Option<i32>,

    /// How accepted connections are served
    #[arg(long, value_enum)]
    pub mode: Option<ServeMode>,

    /// Maximum connections served at once in concurrent mode
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Size of the per-connection receive chunk in bytes
    #[arg(long)]
    pub recv_chunk_size: Option<usize>,

    /// Detach from the terminal after binding the listening socket
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Path of the shared packet log
    #[arg(short = 'f', long)]
    pub data_file: Option<PathBuf>,

    /// Truncate a stale packet log left over from a previous run
    #[arg(long)]
    pub truncate_on_start: bool,

    /// fsync the packet log after every append
    #[arg(long)]
    pub fsync: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Connection scheduling model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServeMode {
    /// One client is served to completion before the next is accepted.
    #[default]
    Sequential,
    /// Each client gets its own task; log access is serialized.
    Concurrent,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default)]
    pub mode: ServeMode,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_recv_chunk_size")]
    pub recv_chunk_size: usize,
    #[serde(default)]
    pub daemon: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            mode: ServeMode::default(),
            max_connections: default_max_connections(),
            recv_chunk_size: default_recv_chunk_size(),
            daemon: false,
        }
    }
}

/// Packet log storage configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Path of the shared packet log
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
    /// Truncate a stale log at startup instead of appending to it
    #[serde(default)]
    pub truncate_on_start: bool,
    /// fsync after every append
    #[serde(default)]
    pub fsync: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
            truncate_on_start: false,
            fsync: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file; stderr when absent
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_backlog() -> i32 {
    10
}

fn default_max_connections() -> usize {
    1024
}

fn default_recv_chunk_size() -> usize {
    1024
}

fn default_data_file() -> PathBuf {
    PathBuf::from("/var/tmp/packet-log.data")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub mode: ServeMode,
    pub max_connections: usize,
    pub recv_chunk_size: usize,
    pub daemon: bool,
    pub data_file: PathBuf,
    pub truncate_on_start: bool,
    pub fsync: bool,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen_str
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen_str.clone()))?;

        let config = Config {
            listen,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            mode: cli.mode.unwrap_or(toml_config.server.mode),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            recv_chunk_size: cli
                .recv_chunk_size
                .unwrap_or(toml_config.server.recv_chunk_size),
            daemon: cli.daemon || toml_config.server.daemon,
            data_file: cli.data_file.unwrap_or(toml_config.storage.data_file),
            truncate_on_start: cli.truncate_on_start || toml_config.storage.truncate_on_start,
            fsync: cli.fsync || toml_config.storage.fsync,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.recv_chunk_size == 0 {
            return Err(ConfigError::Invalid("recv_chunk_size must be non-zero"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be non-zero"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive"));
        }
        Ok(())
    }

    /// Rewrite relative paths against the current directory.
    ///
    /// Daemon mode changes directory to `/`, so this must run before the fork.
    pub fn absolutize_paths(&mut self) -> std::io::Result<()> {
        let cwd = std::env::current_dir()?;
        if self.data_file.is_relative() {
            self.data_file = cwd.join(&self.data_file);
        }
        if let Some(file) = self.log_file.as_mut() {
            if file.is_relative() {
                *file = cwd.join(&*file);
            }
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{addr}'")
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
