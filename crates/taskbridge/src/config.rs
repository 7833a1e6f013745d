//! Runtime configuration.
//!
//! Every config struct has working defaults and can be overridden from
//! `TASKBRIDGE_*` environment variables via `from_env()`.

use std::time::Duration;

use crate::bridge::codec::MAX_FRAME_LENGTH;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}

fn env_lookup(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_with<T, F>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    key: &'static str,
    parse: F,
) -> Result<Option<T>, ConfigError>
where
    F: FnOnce(&str) -> Option<T>,
{
    match lookup(key) {
        Some(raw) => parse(raw.trim())
            .map(Some)
            .ok_or(ConfigError::Invalid { key, value: raw }),
        None => Ok(None),
    }
}

/// Seconds as a float, e.g. "1.5". Negative, NaN and infinite values are rejected.
fn parse_secs(raw: &str) -> Option<Duration> {
    let secs = raw.parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Front-end side of the coordinator channel.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub addr: String,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8765".to_string(),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(120),
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = lookup("TASKBRIDGE_ADDR") {
            config.addr = addr;
        }
        if let Some(t) = parse_with(&lookup, "TASKBRIDGE_CONNECT_TIMEOUT", parse_secs)? {
            config.connect_timeout = t;
        }
        if let Some(t) = parse_with(&lookup, "TASKBRIDGE_RESPONSE_TIMEOUT", parse_secs)? {
            config.response_timeout = t;
        }
        if let Some(n) = parse_with(&lookup, "TASKBRIDGE_MAX_FRAME", |s| s.parse().ok())? {
            config.max_frame_length = n;
        }
        Ok(config)
    }
}

/// Coordinator side of the framed TCP channel.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_length: usize,
    /// How long `shutdown()` waits for open connections to finish their
    /// in-flight request before giving up on them.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            max_frame_length: MAX_FRAME_LENGTH,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_frame_length(mut self, n: usize) -> Self {
        self.max_frame_length = n;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(host) = lookup("TASKBRIDGE_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_with(&lookup, "TASKBRIDGE_PORT", |s| s.parse().ok())? {
            config.port = port;
        }
        if let Some(n) = parse_with(&lookup, "TASKBRIDGE_MAX_FRAME", |s| s.parse().ok())? {
            config.max_frame_length = n;
        }
        Ok(config)
    }
}

/// Command queue broker limits.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Cap on unclaimed results and on the rolling result history.
    pub history_limit: usize,
    /// How many history entries `/status` reports.
    pub status_history: usize,
    /// Default wait for a bridged result.
    pub result_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            status_history: 10,
            result_timeout: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    pub fn with_history_limit(mut self, n: usize) -> Self {
        self.history_limit = n;
        self
    }

    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(n) = parse_with(&lookup, "TASKBRIDGE_HISTORY_LIMIT", |s| {
            s.parse().ok().filter(|n: &usize| *n > 0)
        })? {
            config.history_limit = n;
        }
        if let Some(t) = parse_with(&lookup, "TASKBRIDGE_BRIDGE_TIMEOUT", parse_secs)? {
            config.result_timeout = t;
        }
        Ok(config)
    }
}

/// HTTP bridge server.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// If true, ignore SIGTERM and wait for explicit /shutdown or SIGINT.
    pub await_explicit_shutdown: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            await_explicit_shutdown: false,
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(host) = lookup("TASKBRIDGE_HTTP_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_with(&lookup, "TASKBRIDGE_HTTP_PORT", |s| s.parse().ok())? {
            config.port = port;
        }
        if let Some(flag) = parse_with(&lookup, "TASKBRIDGE_AWAIT_EXPLICIT_SHUTDOWN", |s| {
            match s {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            }
        })? {
            config.await_explicit_shutdown = flag;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(
        pairs: &[(&'static str, &str)],
    ) -> impl Fn(&'static str) -> Option<String> + use<> {
        let map: HashMap<&'static str, String> =
            pairs.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.response_timeout, Duration::from_secs(120));
        assert_eq!(config.max_frame_length, 10 * 1024);
    }

    #[test]
    fn server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.addr(), "127.0.0.1:8765");
        assert_eq!(config.max_frame_length, MAX_FRAME_LENGTH);
    }

    #[test]
    fn broker_config_default() {
        let config = BrokerConfig::default();
        assert_eq!(config.history_limit, 100);
        assert_eq!(config.status_history, 10);
    }

    #[test]
    fn http_config_default() {
        let config = HttpConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert!(!config.await_explicit_shutdown);
    }

    #[test]
    fn client_config_reads_fractional_seconds() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("TASKBRIDGE_ADDR", "10.0.0.2:9000"),
            ("TASKBRIDGE_RESPONSE_TIMEOUT", "1.5"),
        ]))
        .unwrap();
        assert_eq!(config.addr, "10.0.0.2:9000");
        assert_eq!(config.response_timeout, Duration::from_millis(1500));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn invalid_port_is_reported_with_key() {
        let err = ServerConfig::from_lookup(lookup_from(&[("TASKBRIDGE_PORT", "http")]))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid value 'http' for TASKBRIDGE_PORT");
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let err = ClientConfig::from_lookup(lookup_from(&[("TASKBRIDGE_CONNECT_TIMEOUT", "-1")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TASKBRIDGE_CONNECT_TIMEOUT",
                ..
            }
        ));
    }

    #[test]
    fn zero_history_limit_is_rejected() {
        assert!(
            BrokerConfig::from_lookup(lookup_from(&[("TASKBRIDGE_HISTORY_LIMIT", "0")])).is_err()
        );
    }

    #[test]
    fn http_config_reads_flag() {
        let config = HttpConfig::from_lookup(lookup_from(&[
            ("TASKBRIDGE_HTTP_PORT", "9090"),
            ("TASKBRIDGE_AWAIT_EXPLICIT_SHUTDOWN", "true"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9090);
        assert!(config.await_explicit_shutdown);
    }
}
