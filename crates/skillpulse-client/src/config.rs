use std::time::Duration;

use skillpulse_core::DEFAULT_MAX_FRAME_BYTES;
use thiserror::Error;
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::events::DEFAULT_EVENT_CAPACITY;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_CONFIRMATION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_COMPLETED_GRACE_SECS: u64 = 5;
pub const DEFAULT_STALE_SECS: u64 = 300;
pub const DEFAULT_LINK_CAPACITY: usize = 256;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_STEPS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid url '{value}': {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error("invalid value for {key}: '{value}'")]
    InvalidNumber { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub default_confirmation_timeout: Duration,
    pub completed_grace: Duration,
    pub stale_after: Duration,
    pub max_frame_bytes: usize,
    pub event_capacity: usize,
    pub link_capacity: usize,
    /// Largest `total_steps` accepted from the orchestrator.
    pub max_steps: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(DEFAULT_HOST, DEFAULT_PORT),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            backoff: BackoffPolicy::default(),
            default_confirmation_timeout: Duration::from_secs(DEFAULT_CONFIRMATION_TIMEOUT_SECS),
            completed_grace: Duration::from_secs(DEFAULT_COMPLETED_GRACE_SECS),
            stale_after: Duration::from_secs(DEFAULT_STALE_SECS),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            link_capacity: DEFAULT_LINK_CAPACITY,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

impl ClientConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `SKILLPULSE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = value("SKILLPULSE_URL") {
            config.url = url.trim().to_string();
        } else {
            let host = value("SKILLPULSE_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
            let port = match value("SKILLPULSE_PORT") {
                Some(raw) => parse_number::<u16>("SKILLPULSE_PORT", &raw)?,
                None => DEFAULT_PORT,
            };
            config.url = default_url(host.trim(), port);
        }
        validate_url(&config.url)?;

        if let Some(raw) = value("SKILLPULSE_HEARTBEAT_SECS") {
            let secs = parse_number::<u64>("SKILLPULSE_HEARTBEAT_SECS", &raw)?;
            if secs == 0 {
                return Err(ConfigError::InvalidNumber {
                    key: "SKILLPULSE_HEARTBEAT_SECS".to_string(),
                    value: raw,
                });
            }
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(raw) = value("SKILLPULSE_CONNECT_TIMEOUT_SECS") {
            let secs = parse_number::<u64>("SKILLPULSE_CONNECT_TIMEOUT_SECS", &raw)?;
            if secs == 0 {
                return Err(ConfigError::InvalidNumber {
                    key: "SKILLPULSE_CONNECT_TIMEOUT_SECS".to_string(),
                    value: raw,
                });
            }
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = value("SKILLPULSE_RECONNECT_MAX_ATTEMPTS") {
            config.backoff.max_attempts =
                parse_number::<u32>("SKILLPULSE_RECONNECT_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = value("SKILLPULSE_STALE_SECS") {
            config.stale_after =
                Duration::from_secs(parse_number::<u64>("SKILLPULSE_STALE_SECS", &raw)?);
        }
        Ok(config)
    }
}

pub fn default_url(host: &str, port: u16) -> String {
    format!("ws://{host}:{port}")
}

pub fn validate_url(value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|err| ConfigError::InvalidUrl {
        value: value.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidUrl {
            value: value.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_target_local_loopback() {
        let config = ClientConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.url, "ws://127.0.0.1:8765");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.backoff, BackoffPolicy::default());
        assert_eq!(config.completed_grace, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.max_steps, 10_000);
    }

    #[test]
    fn explicit_url_wins_over_host_and_port() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("SKILLPULSE_URL", "ws://10.0.0.5:9000/events"),
            ("SKILLPULSE_HOST", "ignored"),
            ("SKILLPULSE_PORT", "1"),
        ]))
        .expect("config");
        assert_eq!(config.url, "ws://10.0.0.5:9000/events");
    }

    #[test]
    fn host_and_port_compose_url() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("SKILLPULSE_HOST", "localhost"),
            ("SKILLPULSE_PORT", "9999"),
            ("SKILLPULSE_RECONNECT_MAX_ATTEMPTS", "3"),
            ("SKILLPULSE_STALE_SECS", "42"),
            ("SKILLPULSE_CONNECT_TIMEOUT_SECS", "3"),
        ]))
        .expect("config");
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.url, "ws://localhost:9999");
        assert_eq!(config.backoff.max_attempts, 3);
        assert_eq!(config.stale_after, Duration::from_secs(42));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("SKILLPULSE_PORT", "eighty")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("SKILLPULSE_URL", "http://127.0.0.1:1")])),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("SKILLPULSE_HEARTBEAT_SECS", "0")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("SKILLPULSE_CONNECT_TIMEOUT_SECS", "0")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
    }
}
