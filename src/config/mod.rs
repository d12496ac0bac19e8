//! Configuration management

use crate::protocol::{
    CONNECT_TIMEOUT, DEFAULT_WS_PATH, HTTP_DEFAULT_PORT, KEEPALIVE_INTERVAL, RECONNECT_DELAY, SWEEP_INTERVAL,
};
use crate::proxy::{HttpSniffer, StaticTarget, Target, TargetSniffer};
use crate::tunnel::{DemuxConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Relay configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Load `path` if it exists, otherwise use the example configuration
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(generate_example_config())
        }
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content).map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        std::fs::write(path, self.to_toml()?)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, crate::Error> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// WebSocket path tunnels upgrade on
    pub path: String,
    /// Seconds between liveness sweeps
    pub sweep_interval_secs: u64,
    /// Seconds allowed for dialing a destination
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            path: DEFAULT_WS_PATH.to_string(),
            sweep_interval_secs: SWEEP_INTERVAL.as_secs(),
            connect_timeout_secs: CONNECT_TIMEOUT.as_secs(),
        }
    }
}

impl ServerConfig {
    pub fn demux_config(&self) -> DemuxConfig {
        DemuxConfig {
            path: self.path.clone(),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay address (host:port)
    pub relay: String,
    /// WebSocket path on the relay
    pub path: String,
    /// Seconds between keepalive pings
    pub keepalive_interval_secs: u64,
    /// Seconds to wait before redialing a lost tunnel
    pub reconnect_delay_secs: u64,
    /// Local listeners
    pub listeners: Vec<ListenerConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay: "127.0.0.1:8080".to_string(),
            path: DEFAULT_WS_PATH.to_string(),
            keepalive_interval_secs: KEEPALIVE_INTERVAL.as_secs(),
            reconnect_delay_secs: RECONNECT_DELAY.as_secs(),
            listeners: vec![ListenerConfig {
                listen: "127.0.0.1:3128".to_string(),
                mode: ListenMode::Http,
                target: None,
            }],
        }
    }
}

impl ClientConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            relay: self.relay.clone(),
            path: self.path.clone(),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs.max(1)),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
        }
    }
}

/// How a local listener finds the destination of its connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// Forward to a fixed target
    Tcp,
    /// Sniff HTTP requests and CONNECT
    Http,
}

/// One local listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Local listen address
    pub listen: String,
    pub mode: ListenMode,
    /// Destination for `tcp` mode (host:port)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ListenerConfig {
    /// Build the destination strategy for this listener
    pub fn sniffer(&self) -> Result<Arc<dyn TargetSniffer>, crate::Error> {
        match self.mode {
            ListenMode::Http => Ok(Arc::new(HttpSniffer::new())),
            ListenMode::Tcp => {
                let target = self.target.as_deref().ok_or_else(|| {
                    crate::Error::Config(format!("Listener {} in tcp mode needs a target", self.listen))
                })?;
                let target = Target::parse(target, HTTP_DEFAULT_PORT)?;
                Ok(Arc::new(StaticTarget::new(target)))
            }
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_roundtrips() {
        let example = generate_example_config();
        let parsed = Config::parse(&example.to_toml().unwrap()).unwrap();

        let client = parsed.client.unwrap();
        assert_eq!(client.keepalive_interval_secs, 50);
        assert_eq!(client.reconnect_delay_secs, 30);
        assert_eq!(client.listeners[0].mode, ListenMode::Http);
        assert_eq!(parsed.server.unwrap().sweep_interval_secs, 300);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::parse(
            r#"
            [client]
            relay = "relay.example:80"

            [[client.listeners]]
            listen = "127.0.0.1:2222"
            mode = "tcp"
            target = "10.0.0.5:22"
            "#,
        )
        .unwrap();

        assert!(config.server.is_none());
        assert_eq!(config.logging.level, "info");

        let client = config.client.unwrap();
        assert_eq!(client.path, "/ws");
        let session = client.session_config();
        assert_eq!(session.relay, "relay.example:80");
        assert_eq!(session.reconnect_delay, Duration::from_secs(30));

        assert_eq!(client.listeners.len(), 1);
        assert_eq!(client.listeners[0].sniffer().unwrap().name(), "tcp");
    }

    #[test]
    fn test_tcp_listener_requires_target() {
        let listener = ListenerConfig {
            listen: "127.0.0.1:1".into(),
            mode: ListenMode::Tcp,
            target: None,
        };
        assert!(listener.sniffer().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_example() {
        let config = Config::load_or_default("/nonexistent/burrow.toml").unwrap();
        assert!(config.server.is_some());
        assert!(config.client.is_some());
    }
}
