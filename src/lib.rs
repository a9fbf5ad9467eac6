//! Connection and channel management over an AMQP 0-9-1 broker, with publish/subscribe,
//! request/reply and long-running consume loops on top.
//!
//! ```no_run
//! use rabbitmq_bridge::{config::EndpointConfig, ConnectionManager, Message};
//! use std::time::Duration;
//!
//! # async fn run() -> rabbitmq_bridge::Result<()> {
//! let manager = ConnectionManager::lapin();
//! let connection = manager.connect(&EndpointConfig::default()).await?;
//! let channel = connection.default_channel().await?;
//! let answer = channel
//!     .ask("rpc", "echo", Message::text("ping")?, Duration::from_secs(2))
//!     .await?;
//! assert_eq!(answer, b"ping");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod env;
pub mod message;
pub mod messaging;
pub mod rabbitmq;

pub use message::{prepare_message, Delivery, Message, MessageProperties};
pub use messaging::{ConsumerOptions, ExchangeKind, ExchangeOptions, QueueDeleteOptions, QueueOptions};
pub use rabbitmq::{
    Channel, Connection, ConnectionManager, DeliveryHandler, InMemoryBroker, ListenOptions,
    PollOptions, RabbitMQError, Result, StopSignal, DEFAULT_CHANNEL,
};
