//! Configuration for the sockreactor echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::{ReactorConfig, DEFAULT_CHUNK_SLOTS};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Reactor backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// mio readiness reactor (epoll on Linux, kqueue on macOS)
    #[default]
    Readiness,
    /// io_uring completion proactor (Linux only)
    Completion,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Readiness => write!(f, "readiness"),
            Backend::Completion => write!(f, "completion"),
        }
    }
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "sockreactor-echo")]
#[command(author = "sockreactor authors")]
#[command(version = "0.1.0")]
#[command(about = "Echo server over the readiness and completion socket reactors", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Reactor backend
    #[arg(short = 'b', long, value_enum)]
    pub backend: Option<Backend>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Upper bound on one poll or completion wait, in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Readiness events fetched per poll
    #[arg(long)]
    pub events_capacity: Option<usize>,

    /// io_uring submission queue entries
    #[arg(long)]
    pub ring_entries: Option<u32>,

    /// Operation slots per pool chunk
    #[arg(long)]
    pub pool_chunk_slots: Option<usize>,

    /// Bytes requested per receive
    #[arg(long)]
    pub recv_size: Option<usize>,

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
    pub reactor: ReactorSection,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Reactor backend
    #[serde(default)]
    pub backend: Backend,
    /// Bytes requested per receive
    #[serde(default = "default_recv_size")]
    pub recv_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: Backend::default(),
            recv_size: default_recv_size(),
        }
    }
}

/// Reactor thread and polling configuration
#[derive(Debug, Deserialize)]
pub struct ReactorSection {
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    #[serde(default = "default_ring_entries")]
    pub ring_entries: u32,
}

impl Default for ReactorSection {
    fn default() -> Self {
        Self {
            workers: None,
            poll_timeout_ms: default_poll_timeout_ms(),
            events_capacity: default_events_capacity(),
            ring_entries: default_ring_entries(),
        }
    }
}

/// Operation pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_chunk_slots")]
    pub chunk_slots: usize,
    /// Allocate the first chunk at startup
    #[serde(default = "default_preallocate")]
    pub preallocate: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chunk_slots: default_chunk_slots(),
            preallocate: default_preallocate(),
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
    "127.0.0.1:7000".to_string()
}

fn default_recv_size() -> usize {
    4096
}

fn default_poll_timeout_ms() -> u64 {
    10
}

fn default_events_capacity() -> usize {
    128
}

fn default_ring_entries() -> u32 {
    256
}

fn default_chunk_slots() -> usize {
    DEFAULT_CHUNK_SLOTS
}

fn default_preallocate() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backend: Backend,
    pub recv_size: usize,
    pub reactor: ReactorConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments, reading the TOML file they name.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let defaults = ReactorConfig::default();

        let reactor = ReactorConfig {
            workers: cli
                .workers
                .or(toml_config.reactor.workers)
                .unwrap_or(defaults.workers),
            poll_timeout: Duration::from_millis(
                cli.poll_timeout_ms
                    .unwrap_or(toml_config.reactor.poll_timeout_ms),
            ),
            events_capacity: cli
                .events_capacity
                .unwrap_or(toml_config.reactor.events_capacity),
            ring_entries: cli.ring_entries.unwrap_or(toml_config.reactor.ring_entries),
            chunk_slots: cli
                .pool_chunk_slots
                .unwrap_or(toml_config.pool.chunk_slots),
            preallocate: toml_config.pool.preallocate,
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backend: cli.backend.unwrap_or(toml_config.server.backend),
            recv_size: cli.recv_size.unwrap_or(toml_config.server.recv_size),
            reactor,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let zero = if self.reactor.workers == 0 {
            Some("reactor.workers")
        } else if self.reactor.events_capacity == 0 {
            Some("reactor.events_capacity")
        } else if self.reactor.ring_entries == 0 {
            Some("reactor.ring_entries")
        } else if self.reactor.chunk_slots == 0 {
            Some("pool.chunk_slots")
        } else if self.recv_size == 0 {
            Some("server.recv_size")
        } else {
            None
        };

        match zero {
            Some(field) => Err(ConfigError::Invalid(field, "must be greater than zero")),
            None => Ok(()),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str, &'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(field, reason) => {
                write!(f, "Invalid configuration: {field} {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
