//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub federation: FederationConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// The federation name of this server, e.g. `example.org`.
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "adieu_federation=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Location and id of this server's ed25519 signing key.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    /// File holding the unpadded base64 key seed. Created on first start.
    #[serde(default = "default_key_path")]
    pub key_path: String,

    /// Key id the key is published under, e.g. `ed25519:a_1`.
    #[serde(default = "default_key_id")]
    pub key_id: String,
}

/// Outbound federation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Whether queued events are pushed to remote servers.
    #[serde(default = "default_true")]
    pub outbound_enabled: bool,

    /// Seconds between outbox sweeps.
    #[serde(default = "default_outbox_interval_secs")]
    pub outbox_interval_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8448
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_db_path() -> String {
    "adieu.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_key_path() -> String {
    "signing.key".to_string()
}

fn default_key_id() -> String {
    "ed25519:auto".to_string()
}

fn default_true() -> bool {
    true
}

fn default_outbox_interval_secs() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: default_server_name(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_path: default_key_path(),
            key_id: default_key_id(),
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            outbound_enabled: true,
            outbox_interval_secs: default_outbox_interval_secs(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `ADIEU_HOST`, `ADIEU_PORT`, `ADIEU_SERVER_NAME`
/// - `ADIEU_DB_PATH`, `ADIEU_DB_BUSY_TIMEOUT_MS`, `ADIEU_DB_POOL_MAX_SIZE`
/// - `ADIEU_LOG_LEVEL`, `ADIEU_LOG_JSON` ("true" or "1" to enable)
/// - `ADIEU_SIGNING_KEY_PATH`, `ADIEU_SIGNING_KEY_ID`
/// - `ADIEU_FEDERATION_OUTBOUND` ("false" or "0" to disable),
///   `ADIEU_OUTBOX_INTERVAL_SECS`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting server name or key id is unusable.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
        value.and_then(|v| v.parse().ok())
    }
    let flag = |value: String| value == "true" || value == "1";

    if let Some(host) = parsed(var("ADIEU_HOST")) {
        config.server.host = host;
    }
    if let Some(port) = parsed(var("ADIEU_PORT")) {
        config.server.port = port;
    }
    if let Some(name) = var("ADIEU_SERVER_NAME") {
        config.server.server_name = name;
    }
    if let Some(db_path) = var("ADIEU_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(ms) = parsed(var("ADIEU_DB_BUSY_TIMEOUT_MS")) {
        config.database.busy_timeout_ms = ms;
    }
    if let Some(size) = parsed(var("ADIEU_DB_POOL_MAX_SIZE")) {
        config.database.pool_max_size = size;
    }
    if let Some(level) = var("ADIEU_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("ADIEU_LOG_JSON") {
        config.logging.json = flag(json);
    }
    if let Some(key_path) = var("ADIEU_SIGNING_KEY_PATH") {
        config.signing.key_path = key_path;
    }
    if let Some(key_id) = var("ADIEU_SIGNING_KEY_ID") {
        config.signing.key_id = key_id;
    }
    if let Some(enabled) = var("ADIEU_FEDERATION_OUTBOUND") {
        config.federation.outbound_enabled = flag(enabled);
    }
    if let Some(secs) = parsed(var("ADIEU_OUTBOX_INTERVAL_SECS")) {
        config.federation.outbox_interval_secs = secs;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    adieu_types::ServerName::parse(config.server.server_name.as_str())
        .map_err(|e| ConfigError::Invalid(format!("server.server_name: {e}")))?;
    let version = config.signing.key_id.strip_prefix("ed25519:");
    if version.map_or(true, str::is_empty) {
        return Err(ConfigError::Invalid(format!(
            "signing.key_id must look like 'ed25519:<version>', got {:?}",
            config.signing.key_id
        )));
    }
    if config.database.pool_max_size == 0 {
        return Err(ConfigError::Invalid(
            "database.pool_max_size must be at least 1".to_string(),
        ));
    }
    Ok(())
}
