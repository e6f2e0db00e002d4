//! Configuration module for the onclose harness.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// What the binary does once configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Start the endpoint, drive one connection through it and assert
    Verify,
    /// Run the endpoint until interrupted
    Serve,
}

/// Command-line arguments for the harness
#[derive(Parser, Debug)]
#[command(name = "onclose-harness")]
#[command(author = "onclose-harness authors")]
#[command(version = "0.1.0")]
#[command(about = "WebSocket echo endpoint with close-lifecycle verification", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind the endpoint to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Context path the endpoint is deployed under (e.g., /app/)
    #[arg(long)]
    pub context_path: Option<String>,

    /// Host name the driver connects to (defaults to the listen address)
    #[arg(long)]
    pub host: Option<String>,

    /// Seconds to wait for the close callback
    #[arg(short = 't', long)]
    pub timeout_secs: Option<u64>,

    /// Text message exchanged before closing
    #[arg(long, conflicts_with = "no_probe")]
    pub probe: Option<String>,

    /// Close immediately without exchanging a message
    #[arg(long)]
    pub no_probe: bool,

    /// Run mode
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Endpoint-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Deployment context path, joined with `echo`
    #[serde(default = "default_context_path")]
    pub context_path: String,
    /// Concurrent connection cap
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    pub mode: Option<Mode>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            context_path: default_context_path(),
            max_connections: default_max_connections(),
            mode: None,
        }
    }
}

/// Driver-related configuration
#[derive(Debug, Deserialize)]
pub struct DriverConfig {
    pub host: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_probe")]
    pub probe: Option<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            host: None,
            timeout_secs: default_timeout_secs(),
            probe: default_probe(),
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
    "127.0.0.1:8080".to_string()
}

fn default_context_path() -> String {
    "/app/".to_string()
}

fn default_max_connections() -> usize {
    16
}

fn default_timeout_secs() -> u64 {
    100
}

fn default_probe() -> Option<String> {
    Some("hello".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub context_path: String,
    pub max_connections: usize,
    pub host: Option<String>,
    pub timeout: Duration,
    pub probe: Option<String>,
    pub mode: Mode,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let driver = DriverConfig::default();
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            context_path: default_context_path(),
            max_connections: default_max_connections(),
            host: driver.host,
            timeout: Duration::from_secs(driver.timeout_secs),
            probe: driver.probe,
            mode: Mode::Verify,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen))?;

        let probe = if cli.no_probe {
            None
        } else {
            cli.probe.or(toml_config.driver.probe)
        };

        Ok(Config {
            listen,
            context_path: cli
                .context_path
                .unwrap_or(toml_config.server.context_path),
            max_connections: toml_config.server.max_connections.max(1),
            host: cli.host.or(toml_config.driver.host),
            timeout: Duration::from_secs(
                cli.timeout_secs.unwrap_or(toml_config.driver.timeout_secs),
            ),
            probe,
            mode: cli.mode.or(toml_config.server.mode).unwrap_or(Mode::Verify),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Host the driver should dial. A wildcard listen address is dialed
    /// through loopback.
    pub fn connect_host(&self) -> String {
        if let Some(host) = &self.host {
            return host.clone();
        }
        match self.listen.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
            IpAddr::V6(ip) if ip.is_unspecified() => Ipv6Addr::LOCALHOST.to_string(),
            ip => ip.to_string(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
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
                write!(f, "Invalid listen address '{}'", addr)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
