//! Configuration for chatrelay.
//!
//! Settings come from `CHATRELAY_*` environment variables (a `.env` file is
//! loaded via dotenvy early in startup); every option has a default so the
//! broker runs with no configuration at all.

pub(crate) mod helpers;

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::helpers::{parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub broker: BrokerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            gateway: GatewayConfig::resolve()?,
            broker: BrokerConfig::resolve()?,
        })
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl GatewayConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: parse_string_env("CHATRELAY_HOST", defaults.host)?,
            port: parse_optional_env("CHATRELAY_PORT", defaults.port)?,
        })
    }

    /// The socket address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|e| ConfigError::InvalidListenAddr {
            addr,
            reason: format!("{e}"),
        })
    }
}

/// Broker timing and capacity configuration.
///
/// The heartbeat cadence must stay below the liveness window or healthy
/// workers would be evicted between beats.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Ceiling on concurrently connected workers.
    pub max_workers: usize,
    /// Cadence of broker-initiated heartbeat frames.
    pub heartbeat_interval: Duration,
    /// Maximum gap between heartbeat responses before a worker is evicted.
    pub liveness_window: Duration,
    /// How long a dispatch waits for the worker's reply.
    pub response_wait: Duration,
    /// How long a dispatch polls for an idle worker before giving up.
    pub acquire_wait: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_workers: 64,
            heartbeat_interval: Duration::from_secs(25),
            liveness_window: Duration::from_secs(30),
            response_wait: Duration::from_secs(120),
            acquire_wait: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_workers: parse_optional_env("CHATRELAY_MAX_WORKERS", defaults.max_workers)?,
            heartbeat_interval: Duration::from_secs(parse_optional_env(
                "CHATRELAY_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval.as_secs(),
            )?),
            liveness_window: Duration::from_secs(parse_optional_env(
                "CHATRELAY_LIVENESS_WINDOW_SECS",
                defaults.liveness_window.as_secs(),
            )?),
            response_wait: Duration::from_secs(parse_optional_env(
                "CHATRELAY_RESPONSE_WAIT_SECS",
                defaults.response_wait.as_secs(),
            )?),
            acquire_wait: Duration::from_secs(parse_optional_env(
                "CHATRELAY_ACQUIRE_WAIT_SECS",
                defaults.acquire_wait.as_secs(),
            )?),
        })
    }
}
