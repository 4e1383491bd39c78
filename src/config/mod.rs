//! Configuration Module
//!
//! Provides TOML-based configuration for Comet with support for:
//! - Server settings (bind address, endpoint paths, connection limit)
//! - Session timing (read/write deadlines, keepalive interval)
//! - Topic match cache size
//! - Static service definitions with auth tokens
//! - Environment variable overrides (COMET__* prefix)

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::session::SessionOptions;
use crate::topic::DEFAULT_CACHE_MAX;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Listener configuration
    pub server: ServerConfig,
    /// Per-connection session timing
    pub session: SessionConfig,
    /// Topic trie configuration
    pub topic: TopicConfig,
    /// Statically configured services
    #[serde(rename = "service")]
    pub services: Vec<ServiceConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Upgrade path for client peers
    #[serde(default = "default_client_path")]
    pub client_path: String,
    /// Upgrade path for service workers
    #[serde(default = "default_worker_path")]
    pub worker_path: String,
    /// Maximum concurrent connections (0 = unbounded)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_client_path() -> String {
    "/client/conn".to_string()
}
fn default_worker_path() -> String {
    "/service/conn".to_string()
}
fn default_max_connections() -> usize {
    100_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            client_path: default_client_path(),
            worker_path: default_worker_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Session timing configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time allowed between inbound frames
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Deadline for each outbound frame
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Keepalive ping interval
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Pending read/write requests per session
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(15)
}
fn default_write_timeout() -> Duration {
    Duration::from_secs(15)
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_queue_capacity() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            ping_interval: default_ping_interval(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl SessionConfig {
    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            ping_interval: self.ping_interval,
            queue_capacity: self.queue_capacity,
        }
    }
}

/// Topic trie configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Maximum number of cached literal topics
    #[serde(default = "default_cache_max")]
    pub cache_max: usize,
}

fn default_cache_max() -> usize {
    DEFAULT_CACHE_MAX
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            cache_max: default_cache_max(),
        }
    }
}

/// A statically configured service
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name, used in `$.service.<name>.*` topics
    pub name: String,
    /// Queue group shared by the service's workers
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Accepted peer tokens. Empty means peers connect without a token.
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

fn default_queue() -> String {
    "default".to_string()
}

/// Token accepted by a service, with the identity it grants
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    pub identity: String,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `COMET__` prefix with double underscores for nesting:
    ///    - `COMET__SERVER__BIND=0.0.0.0:9000` overrides `server.bind`
    ///    - `COMET__SESSION__PING_INTERVAL=10s` overrides `session.ping_interval`
    ///    - `COMET__TOPIC__CACHE_MAX=4096` overrides `topic.cache_max`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:8080")?
            .set_default("server.client_path", "/client/conn")?
            .set_default("server.worker_path", "/service/conn")?
            .set_default("server.max_connections", 100_000)?
            .set_default("session.read_timeout", "15s")?
            .set_default("session.write_timeout", "15s")?
            .set_default("session.ping_interval", "30s")?
            .set_default("session.queue_capacity", 64)?
            .set_default("topic.cache_max", DEFAULT_CACHE_MAX as i64)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("COMET")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        for (name, value) in [
            ("read_timeout", session.read_timeout),
            ("write_timeout", session.write_timeout),
            ("ping_interval", session.ping_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "session.{} must be greater than zero",
                    name
                )));
            }
        }
        if session.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "session.queue_capacity must be greater than zero".to_string(),
            ));
        }

        if self.topic.cache_max == 0 {
            return Err(ConfigError::Validation(
                "topic.cache_max must be greater than zero".to_string(),
            ));
        }

        for path in [&self.server.client_path, &self.server.worker_path] {
            if !path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "Endpoint path '{}' must start with '/'",
                    path
                )));
            }
        }
        if self.server.client_path == self.server.worker_path {
            return Err(ConfigError::Validation(
                "server.client_path and server.worker_path must differ".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                return Err(ConfigError::Validation(
                    "Service name cannot be empty".to_string(),
                ));
            }
            if service.name.contains(['.', '*', '>']) {
                return Err(ConfigError::Validation(format!(
                    "Service name '{}' cannot contain '.', '*' or '>'",
                    service.name
                )));
            }
            if !names.insert(service.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate service '{}'",
                    service.name
                )));
            }
            if service.queue.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Service '{}' has an empty queue name",
                    service.name
                )));
            }
            if service.tokens.iter().any(|t| t.token.is_empty()) {
                return Err(ConfigError::Validation(format!(
                    "Service '{}' has an empty token",
                    service.name
                )));
            }
        }

        Ok(())
    }
}
