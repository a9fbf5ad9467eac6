// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    /// Invalid or missing connection parameter. Raised at connect time, never retried.
    #[error("RabbitMQ configuration error: {0}")]
    Configuration(String),

    #[error("RabbitMQ connection error: {0}")]
    Connection(String),

    /// The channel was released or its connection was closed or reconnected.
    #[error("Channel '{0}' is no longer valid, acquire it again from the connection")]
    ChannelInvalid(String),

    #[error("No channel registered under '{0}'")]
    UnknownChannel(String),

    #[error("AMQP message can not be empty")]
    EmptyMessage,

    #[error("Broker rejected the operation ({}): {text}", code.map_or_else(|| "no reply code".to_string(), |c| c.to_string()))]
    BrokerOperation { code: Option<u16>, text: String },

    #[error("RPC request timed out after {0:?}")]
    RpcTimeout(Duration),

    #[error("Channel '{0}' already has a request in flight")]
    ChannelBusy(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    pub fn broker(code: u16, text: impl Into<String>) -> Self {
        RabbitMQError::BrokerOperation {
            code: Some(code),
            text: text.into(),
        }
    }

    /// Errors after which a consume or RPC loop must tear down its channel and connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RabbitMQError::Connection(_))
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        match error {
            LapinError::ProtocolError(amqp_error) => RabbitMQError::BrokerOperation {
                code: Some(amqp_error.get_id()),
                text: amqp_error.get_message().as_str().to_string(),
            },
            LapinError::IOError(io) => RabbitMQError::Connection(io.to_string()),
            LapinError::InvalidConnectionState(state) => {
                RabbitMQError::Connection(format!("invalid connection state: {:?}", state))
            }
            other => RabbitMQError::BrokerOperation {
                code: None,
                text: other.to_string(),
            },
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::Connection("Connection timed out".to_string())
    }
}
