// src/rabbitmq/request_response.rs
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::message::{Delivery, Message};
use crate::messaging::{ConsumerOptions, QueueDeleteOptions, QueueOptions};

use super::channel::Channel;
use super::consumer::DeliveryHandler;
use super::errors::{RabbitMQError, Result};

type ReplySlot = Arc<Mutex<Option<Vec<u8>>>>;

/// Keeps the first reply that belongs to the request.
struct ReplyCapture {
    correlation_id: String,
    slot: ReplySlot,
}

#[async_trait]
impl DeliveryHandler for ReplyCapture {
    async fn handle(&mut self, _channel: &Channel, delivery: Delivery) -> Result<()> {
        match delivery.properties.correlation_id.as_deref() {
            Some(id) if id != self.correlation_id => {
                debug!(correlation_id = id, "ignoring reply to another request");
            }
            _ => {
                self.slot.lock().get_or_insert(delivery.body);
            }
        }
        Ok(())
    }
}

impl Channel {
    /// Publishes `message` and waits up to `timeout` for the answer.
    ///
    /// The answer is expected on a private reply queue named in the `reply_to` property and
    /// bound to `exchange` under its own name, so responders publish back to the same
    /// exchange with `reply_to` as routing key. Only one request may be in flight per
    /// channel; use a channel per concurrent request.
    #[instrument(skip(self, message), fields(channel = %self.id()))]
    pub async fn ask(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let _guard = self
            .begin_rpc()
            .ok_or_else(|| RabbitMQError::ChannelBusy(self.id().to_string()))?;

        match self.request(exchange, routing_key, message, timeout).await {
            Ok(body) => Ok(body),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// [`Channel::ask`] with JSON on both sides.
    pub async fn ask_json<T, R>(
        &self,
        exchange: &str,
        routing_key: &str,
        request: &T,
        timeout: Duration,
    ) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let body = self
            .ask(exchange, routing_key, Message::json(request)?, timeout)
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Answers a request received by a consumer: publishes `message` to the request's
    /// exchange, routed by its `reply_to`, echoing the correlation id. Returns false when
    /// the request carried no `reply_to`.
    pub async fn reply(&self, request: &Delivery, message: Message) -> Result<bool> {
        let Some(reply_to) = request.reply_to() else {
            debug!(channel = %self.id(), "request has no reply_to, not answering");
            return Ok(false);
        };

        let mut message = message;
        if let Some(id) = &request.properties.correlation_id {
            message.properties_mut().correlation_id = Some(id.clone());
        }
        self.publish(&request.exchange, reply_to, &message).await?;
        Ok(true)
    }

    async fn request(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let reply_queue = self.declare_queue("", QueueOptions::reply()).await?;
        let mut consumer_tag = None;

        let outcome = self
            .await_reply(
                exchange,
                routing_key,
                message,
                &reply_queue,
                timeout,
                &mut consumer_tag,
            )
            .await;

        if self.is_valid() {
            if let Err(e) = self
                .drop_reply_queue(&reply_queue, consumer_tag.as_deref())
                .await
            {
                warn!(reply_queue = %reply_queue, error = %e, "failed to clean up reply queue");
            }
        }
        outcome
    }

    async fn await_reply(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
        reply_queue: &str,
        timeout: Duration,
        consumer_tag: &mut Option<String>,
    ) -> Result<Vec<u8>> {
        self.bind_queue(reply_queue, exchange, reply_queue).await?;

        let correlation_id = Uuid::new_v4().to_string();
        let slot: ReplySlot = Arc::new(Mutex::new(None));
        let capture = ReplyCapture {
            correlation_id: correlation_id.clone(),
            slot: slot.clone(),
        };
        *consumer_tag = Some(
            self.consume(reply_queue, &ConsumerOptions::no_ack(true), capture)
                .await?,
        );

        let mut message = message;
        message.properties_mut().reply_to = Some(reply_queue.to_string());
        message.properties_mut().correlation_id = Some(correlation_id.clone());
        self.publish(exchange, routing_key, &message).await?;
        debug!(reply_queue, correlation_id = %correlation_id, "request published");

        // One deadline for the whole exchange; unrelated events do not extend it.
        let deadline = Instant::now() + timeout;
        loop {
            let reply = slot.lock().take();
            if let Some(body) = reply {
                return Ok(body);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RabbitMQError::RpcTimeout(timeout));
            }
            self.wait(Some(remaining)).await?;
        }
    }

    async fn drop_reply_queue(&self, queue: &str, consumer_tag: Option<&str>) -> Result<()> {
        if let Some(tag) = consumer_tag {
            self.cancel(tag).await?;
        }
        self.delete_queue(queue, QueueDeleteOptions::default()).await?;
        Ok(())
    }
}
