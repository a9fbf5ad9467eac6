// src/rabbitmq/consumer.rs
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::config::ClientConfig;
use crate::message::Delivery;
use crate::messaging::{ConsumerOptions, ExchangeKind, ExchangeOptions, QueueOptions};

use super::channel::Channel;
use super::errors::Result;

/// Receives the messages of a consumer registration or a polling loop.
///
/// An error ends the loop the handler runs in.
#[async_trait]
pub trait DeliveryHandler: Send {
    async fn handle(&mut self, channel: &Channel, delivery: Delivery) -> Result<()>;
}

#[async_trait]
impl<F> DeliveryHandler for F
where
    F: FnMut(Delivery) + Send,
{
    async fn handle(&mut self, _channel: &Channel, delivery: Delivery) -> Result<()> {
        self(delivery);
        Ok(())
    }
}

/// Acknowledges each delivery once the wrapped handler accepted it.
struct Acknowledging<H> {
    handler: H,
    no_ack: bool,
}

#[async_trait]
impl<H: DeliveryHandler> DeliveryHandler for Acknowledging<H> {
    async fn handle(&mut self, channel: &Channel, delivery: Delivery) -> Result<()> {
        let delivery_tag = delivery.delivery_tag;
        self.handler.handle(channel, delivery).await?;
        if !self.no_ack {
            channel.ack(delivery_tag).await?;
        }
        Ok(())
    }
}

/// Where a push-mode listener takes its messages from.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenOptions {
    pub exchange: String,
    pub routing_key: String,
    pub kind: ExchangeKind,
    /// Existing queue to bind. Empty for a private server-named one.
    pub queue: String,
    pub no_ack: bool,
}

impl ListenOptions {
    pub fn new(exchange: &str, routing_key: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            kind: ExchangeKind::default(),
            queue: String::new(),
            no_ack: true,
        }
    }

    pub fn with_kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_string();
        self
    }

    pub fn with_no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }
}

/// Cooperative stop flag for [`Channel::listen_queue`]. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopState>,
}

#[derive(Debug, Default)]
struct StopState {
    raised: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    pub async fn raised(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub no_ack: bool,
    /// Return as soon as the queue is found empty.
    pub stop_when_empty: bool,
    /// Pause between polls of an empty queue.
    pub idle_backoff: Duration,
    pub stop: Option<StopSignal>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            no_ack: true,
            stop_when_empty: false,
            idle_backoff: Duration::from_millis(50),
            stop: None,
        }
    }
}

impl PollOptions {
    pub fn stop_when_empty(mut self) -> Self {
        self.stop_when_empty = true;
        self
    }

    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    fn should_stop(&self) -> bool {
        self.stop.as_ref().map_or(false, StopSignal::is_raised)
    }

    async fn idle(&self) {
        match &self.stop {
            Some(stop) => {
                tokio::select! {
                    _ = tokio::time::sleep(self.idle_backoff) => {}
                    _ = stop.raised() => {}
                }
            }
            None => tokio::time::sleep(self.idle_backoff).await,
        }
    }
}

impl From<&ClientConfig> for PollOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            no_ack: config.consume_no_ack,
            ..Self::default()
        }
    }
}

impl Channel {
    /// Runs a push-mode listener until every consumer on this channel is cancelled.
    ///
    /// Binds `options.queue`, or a private server-named queue when it is empty, to the
    /// exchange and hands each delivery to `handler`. The channel and its connection are
    /// closed when the loop ends, whether it ends cleanly or with an error.
    pub async fn listen<H>(self, options: ListenOptions, handler: H) -> Result<()>
    where
        H: DeliveryHandler + 'static,
    {
        let result = self.run_listener(&options, handler).await;
        if let Err(e) = &result {
            error!(channel = %self.id(), exchange = %options.exchange, error = %e, "listener failed");
        }
        self.teardown().await;
        info!(channel = %self.id(), exchange = %options.exchange, "listener stopped");
        result
    }

    async fn run_listener<H>(&self, options: &ListenOptions, handler: H) -> Result<()>
    where
        H: DeliveryHandler + 'static,
    {
        let queue = if options.queue.is_empty() {
            let queue = self
                .declare_queue(
                    "",
                    QueueOptions {
                        exclusive: true,
                        ..QueueOptions::default()
                    },
                )
                .await?;
            if options.kind == ExchangeKind::Direct {
                self.declare_exchange(&options.exchange, options.kind, ExchangeOptions::durable())
                    .await?;
            }
            queue
        } else {
            options.queue.clone()
        };

        self.bind_queue(&queue, &options.exchange, &options.routing_key)
            .await?;
        let handler = Acknowledging {
            handler,
            no_ack: options.no_ack,
        };
        let tag = self
            .consume(&queue, &ConsumerOptions::no_ack(options.no_ack), handler)
            .await?;
        info!(channel = %self.id(), queue = %queue, consumer_tag = %tag, "listening");

        while self.has_consumers() {
            self.wait(None).await?;
        }
        Ok(())
    }

    /// Runs a pull-mode loop over `queue`, handing each fetched message to `handler` in
    /// queue order. Ends when the queue is empty and `stop_when_empty` is set, or when the
    /// stop signal is raised; the channel and its connection are closed afterwards.
    pub async fn listen_queue<H>(self, queue: &str, handler: H, options: PollOptions) -> Result<()>
    where
        H: DeliveryHandler,
    {
        let result = self.poll(queue, handler, &options).await;
        if let Err(e) = &result {
            error!(channel = %self.id(), queue, error = %e, "queue poller failed");
        }
        self.teardown().await;
        info!(channel = %self.id(), queue, "queue poller stopped");
        result
    }

    async fn poll<H>(&self, queue: &str, handler: H, options: &PollOptions) -> Result<()>
    where
        H: DeliveryHandler,
    {
        let mut handler = Acknowledging {
            handler,
            no_ack: options.no_ack,
        };
        info!(channel = %self.id(), queue, "polling queue");

        while !options.should_stop() {
            match self.fetch_one(queue, options.no_ack).await? {
                Some(delivery) => handler.handle(self, delivery).await?,
                None if options.stop_when_empty => break,
                None => options.idle().await,
            }
        }
        Ok(())
    }
}
