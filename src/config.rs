use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::packet::DEFAULT_NTP_PORT;
use crate::pool::SelectionPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Round-trip delay above which this server's replies are discarded.
    /// Falls back to `ServiceConfig::max_delay_ms` when unset; 0 disables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_port() -> u16 {
    DEFAULT_NTP_PORT
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerEndpoint {
            host: host.into(),
            port,
            max_delay_ms: None,
        }
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerEndpoint {
    type Err = ConfigError;

    /// Accepts `host`, `host:port`, `[v6]` and `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || ConfigError::InvalidEndpoint(s.to_string());

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| bad())?,
                None if tail.is_empty() => DEFAULT_NTP_PORT,
                None => return Err(bad()),
            };
            if host.is_empty() {
                return Err(bad());
            }
            return Ok(ServerEndpoint::new(host, port));
        }

        match s.rsplit_once(':') {
            // Bare IPv6 literal without brackets
            Some((host, _)) if host.contains(':') => {
                Ok(ServerEndpoint::new(s, DEFAULT_NTP_PORT))
            }
            Some((host, port)) => {
                let port = port.parse().map_err(|_| bad())?;
                if host.is_empty() {
                    return Err(bad());
                }
                Ok(ServerEndpoint::new(host, port))
            }
            None if !s.is_empty() => Ok(ServerEndpoint::new(s, DEFAULT_NTP_PORT)),
            None => Err(bad()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("server pool is empty")]
    EmptyPool,
    #[error("invalid server endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("cooldown_max_ms ({max}) is below cooldown_initial_ms ({initial})")]
    CooldownRange { initial: u64, max: u64 },
    #[error("smoothing_alpha must be in (0, 1], got {0}")]
    SmoothingAlpha(String),
}

/// Settings for the background sync service. All durations in milliseconds
/// so the JSON form stays flat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub servers: Vec<ServerEndpoint>,
    pub poll_interval_ms: u64,
    pub query_timeout_ms: u64,
    /// Consecutive failures before a server is put in cooldown.
    pub failure_threshold: u32,
    pub cooldown_initial_ms: u64,
    pub cooldown_max_ms: u64,
    pub selection: SelectionPolicy,
    /// Poll once right away instead of waiting a full interval.
    pub measure_immediately: bool,
    /// Default per-server round-trip limit; 0 accepts any delay.
    pub max_delay_ms: u64,
    /// Weight of a new sample in the published offset. 1.0 publishes each
    /// sample as measured; smaller values average exponentially.
    pub smoothing_alpha: f64,
}

pub const DEFAULT_SERVERS: &[&str] = &[
    "time.google.com",
    "time.cloudflare.com",
    "pool.ntp.org",
    "time.windows.com",
    "time.apple.com",
];

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            servers: DEFAULT_SERVERS
                .iter()
                .map(|h| ServerEndpoint::new(*h, DEFAULT_NTP_PORT))
                .collect(),
            poll_interval_ms: 30_000,
            query_timeout_ms: 5_000,
            failure_threshold: 3,
            cooldown_initial_ms: 15_000,
            cooldown_max_ms: 600_000,
            selection: SelectionPolicy::default(),
            measure_immediately: true,
            max_delay_ms: 250,
            smoothing_alpha: 1.0,
        }
    }
}

impl ServiceConfig {
    pub fn with_servers(servers: Vec<ServerEndpoint>) -> Self {
        ServiceConfig {
            servers,
            ..ServiceConfig::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: ServiceConfig = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::EmptyPool);
        }
        if let Some(bad) = self
            .servers
            .iter()
            .find(|s| s.host.trim().is_empty() || s.port == 0)
        {
            return Err(ConfigError::InvalidEndpoint(bad.to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("poll_interval_ms"));
        }
        if self.query_timeout_ms == 0 {
            return Err(ConfigError::Zero("query_timeout_ms"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Zero("failure_threshold"));
        }
        if self.cooldown_max_ms < self.cooldown_initial_ms {
            return Err(ConfigError::CooldownRange {
                initial: self.cooldown_initial_ms,
                max: self.cooldown_max_ms,
            });
        }
        // Written to reject NaN as well.
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return Err(ConfigError::SmoothingAlpha(self.smoothing_alpha.to_string()));
        }
        Ok(())
    }

    /// Delay limit for `server`, `None` when unlimited.
    pub fn max_delay_for(&self, server: &ServerEndpoint) -> Option<Duration> {
        match server.max_delay_ms.unwrap_or(self.max_delay_ms) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn cooldown_initial(&self) -> Duration {
        Duration::from_millis(self.cooldown_initial_ms)
    }

    pub fn cooldown_max(&self) -> Duration {
        Duration::from_millis(self.cooldown_max_ms)
    }
}
