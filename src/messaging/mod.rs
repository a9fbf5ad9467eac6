// src/messaging/mod.rs
// Broker-independent parameter types shared by the transports and the channel operations.

pub mod types;

pub use types::{
    ConsumerOptions, ExchangeKind, ExchangeOptions, QueueDeleteOptions, QueueOptions,
};
