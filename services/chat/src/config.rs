use chatrelay_realtime::RelayConfig;
use chatrelay_realtime::config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEPALIVE_INTERVAL};
use secrecy::{ExposeSecret, SecretString};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Where the development backend listens.
    pub bind_address: SocketAddr,
    pub relay_endpoint: String,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub auth_token: Option<SecretString>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let relay_endpoint = std::env::var("RELAY_ENDPOINT")
            .unwrap_or_else(|_| format!("ws://{bind_address}/ws"));
        if relay_endpoint.trim().is_empty() {
            return Err(ConfigError::MissingVar("RELAY_ENDPOINT".to_string()));
        }

        let connect_timeout = duration_ms("RELAY_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT)?;
        let keepalive_interval = duration_ms("RELAY_KEEPALIVE_MS", DEFAULT_KEEPALIVE_INTERVAL)?;

        let auth_token = std::env::var("RELAY_AUTH_TOKEN")
            .ok()
            .filter(|token| !token.is_empty())
            .map(SecretString::from);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            relay_endpoint,
            connect_timeout,
            keepalive_interval,
            auth_token,
            log_level,
        })
    }

    /// Relay options for the chat client.
    pub fn relay_config(&self) -> RelayConfig {
        let mut relay = RelayConfig::new(&self.relay_endpoint)
            .with_connect_timeout(self.connect_timeout)
            .with_keepalive_interval(self.keepalive_interval);
        if let Some(token) = &self.auth_token {
            relay = relay.with_auth_token(token.expose_secret());
        }
        relay
    }
}

fn duration_ms(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    var.to_string(),
                    format!("'{}' is not a positive number of milliseconds", raw),
                )
            }),
        Err(_) => Ok(default),
    }
}
