//! Configuration management

use crate::endpoint::Mode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Endpoint configuration
    pub endpoint: EndpointConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Peer role: "client" or "server"
    pub mode: String,
    /// Address to dial (client) or bind (server), as host:port
    pub address: String,
    /// Directory with the TLS material; empty means plain TCP
    #[serde(default)]
    pub secpath: String,
    /// Verify the server certificate when dialing over TLS
    #[serde(default = "default_verify")]
    pub verify: bool,
    /// Domains this endpoint serves through the links it dials
    #[serde(default)]
    pub domains: Vec<String>,
    /// Domains advertised to the remote peer on connect
    #[serde(default)]
    pub default_domains: Vec<String>,
}

impl EndpointConfig {
    /// Parse the configured mode string.
    pub fn mode(&self) -> Result<Mode, crate::Error> {
        match self.mode.to_lowercase().as_str() {
            "client" => Ok(Mode::Client),
            "server" => Ok(Mode::Server),
            other => Err(crate::Error::Config(format!("unknown mode: {}", other))),
        }
    }
}

fn default_verify() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
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
        endpoint: EndpointConfig {
            mode: "client".to_string(),
            address: "127.0.0.1:9000".to_string(),
            secpath: String::new(),
            verify: true,
            domains: vec!["svc.local".to_string()],
            default_domains: Vec::new(),
        },
        logging: LoggingConfig::default(),
    }
}
