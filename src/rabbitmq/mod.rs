// src/rabbitmq/mod.rs
// Connection and channel lifecycle, messaging operations, RPC and consume loops.

pub mod errors;
pub mod amqp_client;
pub mod in_memory;
pub mod connection;

mod channel;
mod channel_manager;
mod consumer;
mod publisher;
mod request_response;

pub use amqp_client::{
    AmqpTransport, LapinTransport, TransportChannel, TransportConnection, TransportEvent,
};
pub use channel::Channel;
pub use channel_manager::DEFAULT_CHANNEL;
pub use connection::{Connection, ConnectionManager};
pub use consumer::{DeliveryHandler, ListenOptions, PollOptions, StopSignal};
pub use errors::{RabbitMQError, Result};
pub use in_memory::InMemoryBroker;
