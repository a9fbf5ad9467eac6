// src/rabbitmq/publisher.rs
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::message::{prepare_message, Delivery, Message, MessageProperties};
use crate::messaging::{ExchangeKind, ExchangeOptions, QueueDeleteOptions, QueueOptions};

use super::channel::Channel;
use super::errors::Result;

impl Channel {
    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()> {
        self.transport()?.declare_exchange(name, kind, options).await?;
        debug!(channel = %self.id(), exchange = name, kind = %kind, "exchange declared");
        Ok(())
    }

    pub async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()> {
        self.transport()?.delete_exchange(name, if_unused).await?;
        debug!(channel = %self.id(), exchange = name, "exchange deleted");
        Ok(())
    }

    /// Declares a queue and returns its name. Pass an empty name to let the broker pick one.
    pub async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self.transport()?.declare_queue(name, options).await?;
        debug!(channel = %self.id(), queue = %queue, "queue declared");
        Ok(queue)
    }

    /// Deletes a queue, returning how many messages it still held.
    pub async fn delete_queue(&self, name: &str, options: QueueDeleteOptions) -> Result<u32> {
        let dropped = self.transport()?.delete_queue(name, options).await?;
        debug!(channel = %self.id(), queue = name, dropped, "queue deleted");
        Ok(dropped)
    }

    pub async fn purge_queue(&self, name: &str) -> Result<u32> {
        let purged = self.transport()?.purge_queue(name).await?;
        debug!(channel = %self.id(), queue = name, purged, "queue purged");
        Ok(purged)
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.transport()?.bind_queue(queue, exchange, routing_key).await?;
        debug!(channel = %self.id(), queue, exchange, routing_key, "queue bound");
        Ok(())
    }

    /// Publishes a prepared message. The exchange must already exist.
    pub async fn publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        self.transport()?.publish(exchange, routing_key, message).await
    }

    /// Prepares `body` and publishes it with the given application headers.
    ///
    /// For topic sends the exchange is declared durable first, so callers need no separate
    /// declaration. Other kinds expect the exchange to exist. Empty bodies fail before
    /// anything is sent.
    pub async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Value,
        headers: BTreeMap<String, Value>,
        kind: ExchangeKind,
    ) -> Result<()> {
        let properties = MessageProperties::default()
            .with_headers(headers)
            .with_timestamp(Utc::now().timestamp().max(0) as u64);
        let message = prepare_message(body, properties)?;

        if kind == ExchangeKind::Topic {
            self.declare_exchange(exchange, kind, ExchangeOptions::durable())
                .await?;
        }
        self.publish(exchange, routing_key, &message).await?;
        info!(channel = %self.id(), exchange, routing_key, bytes = message.body().len(), "message sent");
        Ok(())
    }

    /// Takes a single message from `queue` without registering a consumer.
    pub async fn fetch_one(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>> {
        self.transport()?.fetch_one(queue, no_ack).await
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.transport()?.ack(delivery_tag).await
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.transport()?.reject(delivery_tag, requeue).await
    }
}
