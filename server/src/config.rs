//! Server configuration module.
//!
//! Parses configuration from environment variables for the UniLink hub.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `UNILINK_JWT_SECRET` | Yes | - | HS256 secret shared with the REST backend (falls back to `JWT_SECRET`) |
//! | `UNILINK_SERVICE_TOKEN` | No | - | Bearer token for `POST /events`; unset disables the endpoint |
//! | `UNILINK_DIRECTORY_URL` | No | - | Base URL of the directory REST API |
//! | `UNILINK_DIRECTORY_KEY` | No | - | API key sent to the directory REST API |
//! | `PORT` | No | 8080 | HTTP server port |
//! | `UNILINK_SESSION_QUEUE` | No | 256 | Outbound messages buffered per session |
//! | `UNILINK_HUB_QUEUE` | No | 1024 | Events buffered between publishers and the hub |
//! | `UNILINK_PING_INTERVAL_SECS` | No | 54 | Keepalive ping period for live sessions |

use std::env;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default per-session outbound queue capacity.
pub const DEFAULT_SESSION_QUEUE: usize = 256;

/// Default capacity of the publish channel into the hub.
pub const DEFAULT_HUB_QUEUE: usize = 1024;

/// Default keepalive ping period.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(54);

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// HS256 secret used to validate client JWTs.
    pub jwt_secret: String,

    /// Bearer token required by `POST /events`.
    pub service_token: Option<String>,

    /// Base URL of the directory REST API.
    pub directory_url: Option<String>,

    /// API key for the directory REST API.
    pub directory_key: Option<String>,

    /// HTTP server port.
    pub port: u16,

    /// Outbound queue capacity per session.
    pub session_queue: usize,

    /// Publish channel capacity.
    pub hub_queue: usize,

    /// Keepalive ping period.
    pub ping_interval: Duration,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - No JWT secret is configured
    /// - Environment variables have invalid format
    /// - Port number is not a valid u16
    ///
    /// # Example
    ///
    /// ```no_run
    /// use unilink_hub::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Hub will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = env::var("UNILINK_JWT_SECRET")
            .or_else(|_| env::var("JWT_SECRET"))
            .unwrap_or_default();

        let config = Self {
            jwt_secret,
            service_token: non_empty_env("UNILINK_SERVICE_TOKEN"),
            directory_url: non_empty_env("UNILINK_DIRECTORY_URL"),
            directory_key: non_empty_env("UNILINK_DIRECTORY_KEY"),
            port: parse_port()?,
            session_queue: parse_usize_env("UNILINK_SESSION_QUEUE", DEFAULT_SESSION_QUEUE)?,
            hub_queue: parse_usize_env("UNILINK_HUB_QUEUE", DEFAULT_HUB_QUEUE)?,
            ping_interval: Duration::from_secs(parse_usize_env(
                "UNILINK_PING_INTERVAL_SECS",
                DEFAULT_PING_INTERVAL.as_secs() as usize,
            )? as u64),
        };

        config.validate()?;

        if config.service_token.is_none() {
            warn!("UNILINK_SERVICE_TOKEN is not set - POST /events will reject every request");
        }
        if config.directory_url.is_none() {
            warn!(
                "UNILINK_DIRECTORY_URL is not set - using an empty in-memory directory, \
                 connections will be rejected as unknown users"
            );
        }

        Ok(config)
    }

    /// Configuration for tests and embedding, with defaults for everything
    /// but the JWT secret.
    pub fn with_secret(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            service_token: None,
            directory_url: None,
            directory_key: None,
            port: DEFAULT_PORT,
            session_queue: DEFAULT_SESSION_QUEUE,
            hub_queue: DEFAULT_HUB_QUEUE,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::MissingEnvVar("UNILINK_JWT_SECRET".to_string()));
        }

        if self.session_queue == 0 {
            return Err(ConfigError::ValidationError(
                "UNILINK_SESSION_QUEUE must be at least 1".to_string(),
            ));
        }

        if self.hub_queue == 0 {
            return Err(ConfigError::ValidationError(
                "UNILINK_HUB_QUEUE must be at least 1".to_string(),
            ));
        }

        if self.ping_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "UNILINK_PING_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        if self.directory_url.is_some() && self.directory_key.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "UNILINK_DIRECTORY_KEY".to_string(),
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("jwt_secret", &"<redacted>")
            .field("service_token", &self.service_token.as_ref().map(|_| "<redacted>"))
            .field("directory_url", &self.directory_url)
            .field("directory_key", &self.directory_key.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .field("session_queue", &self.session_queue)
            .field("hub_queue", &self.hub_queue)
            .field("ping_interval", &self.ping_interval)
            .finish()
    }
}

/// Read an environment variable, treating empty values as unset.
fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse a positive integer environment variable, falling back to `default`.
fn parse_usize_env(name: &str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("expected a positive integer, got '{value}'"),
        }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}
