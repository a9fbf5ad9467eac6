// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::rabbitmq::errors::RabbitMQError;

pub const CONFIG_FILE_NAME: &str = "rabbitmq_bridge.json";

/// Where and how to reach one broker. Immutable once a connection is created from it,
/// and used as the connection registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default)]
    pub options: EndpointOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointOptions {
    #[serde(default)]
    pub heartbeat_seconds: Option<u16>,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub connection_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub connection: EndpointConfig,
    /// Whether consume loops run without acknowledgements.
    #[serde(default = "default_consume_no_ack")]
    pub consume_no_ack: bool,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_vhost() -> String { "/".to_string() }
fn default_connection_timeout() -> u64 { 3000 }
fn default_consume_no_ack() -> bool { true }
fn default_rpc_timeout() -> u64 { 5000 }

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            heartbeat_seconds: None,
            connection_timeout_ms: default_connection_timeout(),
            tls: false,
            connection_name: None,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: default_vhost(),
            options: EndpointOptions::default(),
        }
    }
}

impl EndpointConfig {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            ..Self::default()
        }
    }

    pub fn with_vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_string();
        self
    }

    pub fn with_options(mut self, options: EndpointOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> Result<(), RabbitMQError> {
        if self.username.is_empty() {
            return Err(RabbitMQError::Configuration(
                "parameter 'username' was not set for AMQP connection".to_string(),
            ));
        }
        if self.host.is_empty() {
            return Err(RabbitMQError::Configuration(
                "parameter 'host' was not set for AMQP connection".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.options.connection_timeout_ms)
    }

    /// Endpoint rendered for logs, without credentials.
    pub fn display_addr(&self) -> String {
        let scheme = if self.options.tls { "amqps" } else { "amqp" };
        format!("{}://{}@{}:{}/{}", scheme, self.username, self.host, self.port, self.vhost)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: EndpointConfig::default(),
            consume_no_ack: default_consume_no_ack(),
            rpc_timeout_ms: default_rpc_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    let config_dir_path = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [
        ("Current directory", Path::new(CONFIG_FILE_NAME).to_path_buf()),
        ("Config directory", config_dir_path),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, config/, or your home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config() -> Result<ClientConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(config_path: &Path) -> Result<ClientConfig> {
    let config_content = fs::read_to_string(config_path)
        .context(format!("Failed to read config file at {}", config_path.display()))?;

    let config: ClientConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    config
        .connection
        .validate()
        .map_err(|e| anyhow!("Configuration error: {}", e))?;

    Ok(config)
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&ClientConfig::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
