use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Command-line arguments.
///
/// Every setting is optional and only the ones given (directly or through
/// their `CLOUD_*` variable) are serialized, so an unset flag never masks a
/// value from the TOML file.
#[derive(Parser, Serialize, Debug)]
#[command(name = "cloud-server", version, about = "Personal cloud-storage server")]
pub struct Cli {
    /// Port to listen on [default: 8088]
    #[arg(long, env = "CLOUD_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "CLOUD_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./cloud.toml")]
    pub config: String,

    /// Enable structured JSON logging
    #[arg(long, env = "CLOUD_JSON_LOGS")]
    #[serde(skip_serializing_if = "is_false")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "is_false")]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, content blobs) [default: ./data]
    #[arg(long, env = "CLOUD_DATA_DIR")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Token strength: 1 = 128-bit, 2 = 192-bit, 3 = 256-bit [default: 1]
    #[arg(long, env = "CLOUD_SECURITY_LEVEL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_level: Option<u8>,

    /// Receive buffer capacity in bytes for a connection [default: 1024]
    #[arg(long, env = "CLOUD_AUTH_BUFFER_SIZE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_buffer_size: Option<usize>,

    /// Receive poll tick in milliseconds [default: 50]
    #[arg(long, env = "CLOUD_TICK_INTERVAL_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_interval_ms: Option<u64>,

    /// Consecutive empty ticks before a pending receive times out [default: 200]
    #[arg(long, env = "CLOUD_IDLE_TICK_LIMIT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_tick_limit: Option<u32>,

    /// Maximum parallel transmission channels per logged-in user [default: 8]
    #[arg(long, env = "CLOUD_MAX_TRANSMISSION_CHANNELS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_transmission_channels: Option<usize>,

    /// Seed an account at startup, as `name:password` (repeatable)
    #[arg(long = "add-user", value_name = "NAME:PASSWORD")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_user: Vec<String>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Resolved server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    /// Path the TOML layer was read from
    pub config: String,
    pub json_logs: bool,
    pub generate_config: bool,
    pub data_dir: String,
    pub security_level: u8,
    pub auth_buffer_size: usize,
    pub tick_interval_ms: u64,
    pub idle_tick_limit: u32,
    pub max_transmission_channels: usize,
    #[serde(default)]
    pub add_user: Vec<String>,
    /// Content store configuration (loaded from [content] section in TOML)
    #[serde(default)]
    pub content: Option<ContentConfig>,
}

/// Configuration for the deduplicated content store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Interval in seconds between maintenance sweeps (default: 3600 = 1 hour)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Age in seconds after which an unconsumed `put` reference is dropped
    /// by the sweep (default: 3600 = 1 hour)
    #[serde(default = "default_reservation_grace")]
    pub reservation_grace_secs: u64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            reservation_grace_secs: default_reservation_grace(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_reservation_grace() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8088,
            bind_address: "0.0.0.0".to_string(),
            config: "./cloud.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            security_level: 1,
            auth_buffer_size: 1024,
            tick_interval_ms: 50,
            idle_tick_limit: 200,
            max_transmission_channels: 8,
            add_user: Vec::new(),
            content: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (CLOUD_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::from_cli(Cli::parse())
    }

    /// Layer `cli` over the TOML file it names, the environment and the
    /// built-in defaults.
    pub fn from_cli(cli: Cli) -> Result<Self, figment::Error> {
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("CLOUD_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    /// Resolve the listen address, rejecting an unparsable IP or port 0.
    pub fn listen_addr(&self) -> Result<SocketAddr, String> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|e| format!("Invalid bind address {}: {}", self.bind_address, e))?;
        if self.port == 0 {
            return Err("Port must be in 1..=65535".to_string());
        }
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Parse `--add-user` entries into (username, password) pairs.
    pub fn seed_users(&self) -> Result<Vec<(String, String)>, String> {
        self.add_user
            .iter()
            .map(|entry| match entry.split_once(':') {
                Some((name, password)) if !name.is_empty() => {
                    Ok((name.to_string(), password.to_string()))
                }
                _ => Err(format!("Invalid --add-user entry {:?}, expected name:password", entry)),
            })
            .collect()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Cloud Server Configuration
# Place this file at ./cloud.toml or specify with --config <path>
# All settings can be overridden via environment variables (CLOUD_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8088)
# port = 8088

# Bind address (default: 0.0.0.0 - all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging
# json_logs = false

# Data directory for the SQLite database and content blobs
# data_dir = "./data"

# Token strength: 1 = 16-byte token (AES-128), 2 = 24-byte (AES-192), 3 = 32-byte (AES-256)
# The token is sent in the clear as the first message of every connection and then
# used as the cipher key, so it does not protect against a passive eavesdropper.
# security_level = 1

# Receive buffer capacity for a connection, bounds the credential frame size
# auth_buffer_size = 1024

# Receive poll tick and how many empty ticks a pending receive may wait
# tick_interval_ms = 50
# idle_tick_limit = 200

# Parallel transmission channels a logged-in user may open
# max_transmission_channels = 8

# ---- Content Store ----
# [content]

# Interval in seconds between maintenance sweeps (default: 3600 = 1 hour)
# sweep_interval_secs = 3600

# Age in seconds after which a stored-but-never-bound upload reference is
# dropped by the sweep (default: 3600 = 1 hour)
# reservation_grace_secs = 3600
"#
    .to_string()
}
