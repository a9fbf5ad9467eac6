use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;
use std::str::FromStr;

use crate::config::{ClientConfig, EndpointConfig, EndpointOptions};

/// Reads the client configuration from `RABBITMQ_*` environment variables, after
/// loading a `.env` file if one is present. Unset variables keep their defaults.
pub fn load() -> Result<ClientConfig> {
    dotenv().ok();
    from_lookup(|key| env::var(key).ok())
}

/// Builds the configuration from any key lookup.
pub fn from_lookup<F>(lookup: F) -> Result<ClientConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = ClientConfig::default();
    let endpoint_defaults = EndpointConfig::default();
    let option_defaults = EndpointOptions::default();

    let connection = EndpointConfig {
        host: lookup("RABBITMQ_HOST").unwrap_or(endpoint_defaults.host),
        port: parse_or(&lookup, "RABBITMQ_PORT", endpoint_defaults.port)?,
        username: lookup("RABBITMQ_USERNAME").unwrap_or(endpoint_defaults.username),
        password: lookup("RABBITMQ_PASSWORD").unwrap_or(endpoint_defaults.password),
        vhost: lookup("RABBITMQ_VHOST").unwrap_or(endpoint_defaults.vhost),
        options: EndpointOptions {
            heartbeat_seconds: match lookup("RABBITMQ_HEARTBEAT") {
                Some(val) => Some(val.parse().context("RABBITMQ_HEARTBEAT must be a number")?),
                None => option_defaults.heartbeat_seconds,
            },
            connection_timeout_ms: parse_or(
                &lookup,
                "RABBITMQ_CONNECT_TIMEOUT_MS",
                option_defaults.connection_timeout_ms,
            )?,
            tls: parse_or(&lookup, "RABBITMQ_TLS", option_defaults.tls)?,
            connection_name: lookup("RABBITMQ_CONNECTION_NAME"),
        },
    };

    Ok(ClientConfig {
        connection,
        consume_no_ack: parse_or(&lookup, "RABBITMQ_CONSUME_NO_ACK", defaults.consume_no_ack)?,
        rpc_timeout_ms: parse_or(&lookup, "RABBITMQ_RPC_TIMEOUT_MS", defaults.rpc_timeout_ms)?,
    })
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(val) => val
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, val)),
        None => Ok(default),
    }
}

/// True when the demo should run against the in-process broker.
pub fn use_in_memory_broker() -> bool {
    matches!(env::var("RABBITMQ_IN_MEMORY").as_deref(), Ok("1") | Ok("true"))
}
