//! Bus configuration and AMQP URL construction.

use serde::{Deserialize, Deserializer};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default RPC timeout, applied to client calls and server handlers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default AMQP protocol scheme.
pub const DEFAULT_PROTOCOL: &str = "amqp";

/// Default broker host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default AMQP port.
pub const DEFAULT_PORT: u16 = 5672;

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Broker location: either a literal URL or its parts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AmqpConfig {
    /// Used verbatim.
    Url(String),
    /// Assembled by [`format_amqp_url`].
    Options(AmqpOptions),
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self::Options(AmqpOptions::default())
    }
}

impl From<&str> for AmqpConfig {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<String> for AmqpConfig {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<AmqpOptions> for AmqpConfig {
    fn from(options: AmqpOptions) -> Self {
        Self::Options(options)
    }
}

/// Optional URL parts. Empty strings and a zero port count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpOptions {
    pub url: Option<String>,
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
    pub vhost: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Build the connection URL.
///
/// `"{protocol}://{user[:pass]@}{host}:{port}{/vhost}"`, except that a literal URL
/// (or `options.url`, even when empty) is returned unmodified.
pub fn format_amqp_url(config: &AmqpConfig) -> String {
    let opts = match config {
        AmqpConfig::Url(url) => return url.clone(),
        AmqpConfig::Options(opts) => opts,
    };

    if let Some(url) = &opts.url {
        return url.clone();
    }

    let protocol = non_empty(&opts.protocol).unwrap_or(DEFAULT_PROTOCOL);
    let host = non_empty(&opts.host).unwrap_or(DEFAULT_HOST);
    let auth = match (non_empty(&opts.username), non_empty(&opts.password)) {
        (Some(user), Some(pass)) => format!("{user}:{pass}@"),
        (Some(user), None) => format!("{user}@"),
        (None, _) => String::new(),
    };
    let port = opts.port.filter(|p| *p != 0).unwrap_or(DEFAULT_PORT);
    let vhost = non_empty(&opts.vhost)
        .map(|v| format!("/{v}"))
        .unwrap_or_default();

    format!("{protocol}://{auth}{host}:{port}{vhost}")
}

/// Top level bus configuration.
///
/// Deserializes from `{"amqp": <url or options>, "timeout": <milliseconds>}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BusConfig {
    /// Broker location.
    #[serde(default)]
    pub amqp: AmqpConfig,

    /// RPC timeout for client calls and server handlers.
    #[serde(default = "default_timeout", deserialize_with = "timeout_millis")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

// A missing, null or zero timeout falls back to the default.
fn timeout_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TIMEOUT))
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            amqp: AmqpConfig::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl BusConfig {
    /// Configuration for a literal broker URL with the default timeout.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            amqp: AmqpConfig::Url(url.into()),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the RPC timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The broker URL this configuration points at.
    pub fn url(&self) -> String {
        format_amqp_url(&self.amqp)
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `COURIER_AMQP_URL`: full URL, takes precedence over the parts below
    /// - `COURIER_AMQP_PROTOCOL`: scheme (default: amqp)
    /// - `COURIER_AMQP_HOST`: host (default: localhost)
    /// - `COURIER_AMQP_PORT`: port (default: 5672)
    /// - `COURIER_AMQP_USERNAME` / `COURIER_AMQP_PASSWORD`: credentials
    /// - `COURIER_AMQP_VHOST`: virtual host
    /// - `COURIER_RPC_TIMEOUT_MS`: RPC timeout in milliseconds (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parse_port = |key: &str| -> Result<Option<u16>, ConfigError> {
            lookup(key)
                .map(|v| {
                    v.parse().map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: v,
                    })
                })
                .transpose()
        };

        let amqp = match lookup("COURIER_AMQP_URL") {
            Some(url) => AmqpConfig::Url(url),
            None => AmqpConfig::Options(AmqpOptions {
                url: None,
                protocol: lookup("COURIER_AMQP_PROTOCOL"),
                host: lookup("COURIER_AMQP_HOST"),
                username: lookup("COURIER_AMQP_USERNAME"),
                password: lookup("COURIER_AMQP_PASSWORD"),
                port: parse_port("COURIER_AMQP_PORT")?,
                vhost: lookup("COURIER_AMQP_VHOST"),
            }),
        };

        let timeout = match lookup("COURIER_RPC_TIMEOUT_MS") {
            Some(v) => {
                let ms: u64 = v.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "COURIER_RPC_TIMEOUT_MS".to_string(),
                    value: v,
                })?;
                Duration::from_millis(ms)
            }
            None => DEFAULT_TIMEOUT,
        };

        Ok(Self { amqp, timeout })
    }
}
