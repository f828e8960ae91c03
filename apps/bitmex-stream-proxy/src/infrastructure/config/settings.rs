//! Proxy Configuration Settings
//!
//! Configuration types for the stream proxy, loaded from environment variables.

use std::time::Duration;

/// BitMEX environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Production realtime API.
    #[default]
    Production,
    /// Testnet realtime API.
    Testnet,
}

impl Environment {
    /// Parse environment from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "testnet" | "test" => Self::Testnet,
            _ => Self::Production,
        }
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Testnet => "testnet",
        }
    }

    /// Default realtime WebSocket URL for this environment.
    #[must_use]
    pub const fn default_ws_url(&self) -> &'static str {
        match self {
            Self::Production => "wss://ws.bitmex.com/realtime",
            Self::Testnet => "wss://ws.testnet.bitmex.com/realtime",
        }
    }
}

/// Upstream connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    /// Realtime WebSocket URL.
    pub url: String,
    /// Data table subscribed per symbol.
    pub table: String,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Silence tolerated after a ping before the connection is lost.
    pub heartbeat_timeout: Duration,
    /// Time to wait for a control acknowledgement (`None` = forever).
    pub ack_timeout: Option<Duration>,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: Environment::default().default_ws_url().to_string(),
            table: "instrument".to_string(),
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(20),
            ack_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Downstream WebSocket port.
    pub port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
    /// Outbound frame queue per downstream client.
    pub client_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            health_port: 8082,
            client_buffer: 1024,
        }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    /// BitMEX environment.
    pub environment: Environment,
    /// Upstream connection settings.
    pub upstream: UpstreamSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream URL or table is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream URL or table is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let environment = lookup("BITMEX_ENV")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let url = match lookup("BITMEX_WS_URL") {
            Some(url) if !url.trim().is_empty() => {
                let url = url.trim().to_string();
                if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                    return Err(ConfigError::InvalidValue {
                        key: "BITMEX_WS_URL".to_string(),
                        reason: "must start with ws:// or wss://".to_string(),
                    });
                }
                url
            }
            _ => environment.default_ws_url().to_string(),
        };

        let table = lookup("BITMEX_TABLE").map_or_else(
            || UpstreamSettings::default().table,
            |t| t.trim().to_string(),
        );
        if table.is_empty() {
            return Err(ConfigError::EmptyValue("BITMEX_TABLE".to_string()));
        }
        if table.contains(':') {
            return Err(ConfigError::InvalidValue {
                key: "BITMEX_TABLE".to_string(),
                reason: "must not contain ':'".to_string(),
            });
        }

        let defaults = UpstreamSettings::default();
        let ack_timeout = parse_u64(&lookup, "STREAM_PROXY_ACK_TIMEOUT_SECS").map_or(
            defaults.ack_timeout,
            |secs| (secs > 0).then(|| Duration::from_secs(secs)),
        );

        let upstream = UpstreamSettings {
            url,
            table,
            heartbeat_interval: parse_duration_secs(
                &lookup,
                "STREAM_PROXY_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_duration_secs(
                &lookup,
                "STREAM_PROXY_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            ack_timeout,
        };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            port: parse_or(&lookup, "STREAM_PROXY_PORT", server_defaults.port),
            health_port: parse_or(
                &lookup,
                "STREAM_PROXY_HEALTH_PORT",
                server_defaults.health_port,
            ),
            client_buffer: parse_or(
                &lookup,
                "STREAM_PROXY_CLIENT_BUFFER",
                server_defaults.client_buffer,
            )
            .max(1),
        };

        Ok(Self {
            environment,
            upstream,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn parse_duration_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    parse_u64(lookup, key).map_or(default, Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<ProxyConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ProxyConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn environment_parsing() {
        assert_eq!(
            Environment::from_str_case_insensitive("testnet"),
            Environment::Testnet
        );
        assert_eq!(
            Environment::from_str_case_insensitive("TESTNET"),
            Environment::Testnet
        );
        assert_eq!(
            Environment::from_str_case_insensitive("production"),
            Environment::Production
        );
        assert_eq!(
            Environment::from_str_case_insensitive("unknown"),
            Environment::Production
        );
    }

    #[test]
    fn defaults_without_variables() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.upstream.url, "wss://ws.bitmex.com/realtime");
        assert_eq!(config.upstream.table, "instrument");
        assert_eq!(config.upstream.ack_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.health_port, 8082);
        assert_eq!(config.server.client_buffer, 1024);
    }

    #[test]
    fn testnet_selects_testnet_url() {
        let config = config_from(&[("BITMEX_ENV", "testnet")]).unwrap();
        assert_eq!(config.environment, Environment::Testnet);
        assert_eq!(config.upstream.url, "wss://ws.testnet.bitmex.com/realtime");
    }

    #[test]
    fn explicit_url_overrides_environment() {
        let config = config_from(&[
            ("BITMEX_ENV", "testnet"),
            ("BITMEX_WS_URL", "ws://127.0.0.1:9000/realtime"),
        ])
        .unwrap();
        assert_eq!(config.upstream.url, "ws://127.0.0.1:9000/realtime");
    }

    #[test]
    fn non_websocket_url_is_rejected() {
        let err = config_from(&[("BITMEX_WS_URL", "https://www.bitmex.com")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "BITMEX_WS_URL"));
    }

    #[test]
    fn table_validation() {
        assert_eq!(
            config_from(&[("BITMEX_TABLE", "  ")]).unwrap_err(),
            ConfigError::EmptyValue("BITMEX_TABLE".to_string())
        );
        assert!(config_from(&[("BITMEX_TABLE", "instrument:XBTUSD")]).is_err());
        assert_eq!(
            config_from(&[("BITMEX_TABLE", "quote")]).unwrap().upstream.table,
            "quote"
        );
    }

    #[test]
    fn numeric_overrides_and_fallbacks() {
        let config = config_from(&[
            ("STREAM_PROXY_PORT", "9000"),
            ("STREAM_PROXY_HEALTH_PORT", "not-a-port"),
            ("STREAM_PROXY_HEARTBEAT_INTERVAL_SECS", "5"),
            ("STREAM_PROXY_CLIENT_BUFFER", "0"),
        ])
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.health_port, 8082);
        assert_eq!(config.upstream.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.server.client_buffer, 1);
    }

    #[test]
    fn zero_ack_timeout_disables_it() {
        let config = config_from(&[("STREAM_PROXY_ACK_TIMEOUT_SECS", "0")]).unwrap();
        assert_eq!(config.upstream.ack_timeout, None);

        let config = config_from(&[("STREAM_PROXY_ACK_TIMEOUT_SECS", "3")]).unwrap();
        assert_eq!(config.upstream.ack_timeout, Some(Duration::from_secs(3)));
    }
}
