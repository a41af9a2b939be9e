//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "tls-echo")]
#[command(version = "0.1.0")]
#[command(about = "A buffering TLS echo server", long_about = None)]
pub struct CliArgs {
    /// Host name or IPv4 address to listen on
    pub host: String,

    /// Port number to listen on
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// PEM file with the root CA certificate(s)
    #[arg(long)]
    pub ca_file: Option<PathBuf>,

    /// PEM file with the server certificate chain
    #[arg(long)]
    pub cert_file: Option<PathBuf>,

    /// PEM file with the server private key
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Require clients to present a certificate signed by the root CA
    #[arg(long)]
    pub verify_client: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Certificate and key locations
#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_ca_file")]
    pub ca_file: PathBuf,
    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    #[serde(default)]
    pub verify_client: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_file: default_ca_file(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            verify_client: false,
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

fn default_ca_file() -> PathBuf {
    PathBuf::from("../CA/root.pem")
}

fn default_cert_file() -> PathBuf {
    PathBuf::from("../CA/server.crt")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("../CA/server.key")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub tls: TlsSettings,
    pub log_level: String,
}

/// Resolved TLS file locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub verify_client: bool,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = match CliArgs::try_parse() {
            Ok(cli) => cli,
            Err(e) if e.use_stderr() => return Err(ConfigError::Usage(e)),
            // --help and --version
            Err(e) => e.exit(),
        };
        Self::from_cli(cli)
    }

    /// Merge parsed CLI args with the TOML file they point to.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            host: cli.host,
            port: cli.port,
            tls: TlsSettings {
                ca_file: cli.ca_file.unwrap_or(toml_config.tls.ca_file),
                cert_file: cli.cert_file.unwrap_or(toml_config.tls.cert_file),
                key_file: cli.key_file.unwrap_or(toml_config.tls.key_file),
                verify_client: cli.verify_client || toml_config.tls.verify_client,
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Usage(clap::Error),
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Usage(e) => write!(f, "{}", e.render()),
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
