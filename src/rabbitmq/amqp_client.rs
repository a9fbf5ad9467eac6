// src/rabbitmq/amqp_client.rs
//! The transport seam. The core only talks to a broker through these traits;
//! `LapinTransport` binds them to a real RabbitMQ, `InMemoryBroker` to an in-process one.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicPublishOptions, BasicRejectOptions, ChannelFlowOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions as LapinQueueDeleteOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, ConnectionProperties,
};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::config::EndpointConfig;
use crate::message::{Delivery, Message, MessageProperties};
use crate::messaging::{
    ConsumerOptions, ExchangeKind, ExchangeOptions, QueueDeleteOptions, QueueOptions,
};

use super::errors::{RabbitMQError, Result};

/// Something a channel pushes to its owner outside of a request/response exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Delivery(Delivery),
    /// The broker dropped a consumer, e.g. because its queue was deleted.
    ConsumerCancelled(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    async fn open_connection(&self, endpoint: &EndpointConfig)
        -> Result<Box<dyn TransportConnection>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn TransportChannel>>;

    async fn close(&self) -> Result<()>;

    /// Must not block and must not fail.
    fn is_connected(&self) -> bool;
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()>;

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()>;

    /// Returns the queue name, which the broker picks when `name` is empty.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    async fn delete_queue(&self, name: &str, options: QueueDeleteOptions) -> Result<u32>;

    async fn purge_queue(&self, name: &str) -> Result<u32>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()>;

    /// Starts pushing deliveries from `queue`; returns the effective consumer tag.
    async fn consume(&self, queue: &str, options: &ConsumerOptions) -> Result<String>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn fetch_one(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Waits for the next pushed event. `Ok(None)` means the timeout elapsed first.
    /// Dropping the returned future must not lose an event.
    async fn next_event(&self, timeout: Option<Duration>) -> Result<Option<TransportEvent>>;

    /// Asks the broker to pause (`false`) or resume (`true`) pushing deliveries.
    /// Returns the flow state the broker confirmed.
    async fn flow(&self, active: bool) -> Result<bool>;

    /// False once the channel was closed, by us or by a broker-side channel error.
    /// Must not block and must not fail.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// RabbitMQ over lapin.
#[derive(Debug, Default, Clone)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Self {
        Self
    }

    fn amqp_uri(endpoint: &EndpointConfig) -> AMQPUri {
        AMQPUri {
            scheme: if endpoint.options.tls {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: endpoint.username.clone(),
                    password: endpoint.password.clone(),
                },
                host: endpoint.host.clone(),
                port: endpoint.port,
            },
            vhost: endpoint.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: endpoint.options.heartbeat_seconds,
                connection_timeout: Some(endpoint.options.connection_timeout_ms),
                ..AMQPQueryString::default()
            },
        }
    }
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    async fn open_connection(
        &self,
        endpoint: &EndpointConfig,
    ) -> Result<Box<dyn TransportConnection>> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &endpoint.options.connection_name {
            properties = properties.with_connection_name(LongString::from(name.clone()));
        }

        let connection = tokio::time::timeout(
            endpoint.connection_timeout(),
            lapin::Connection::connect_uri(Self::amqp_uri(endpoint), properties),
        )
        .await
        .map_err(|_| {
            RabbitMQError::Connection(format!(
                "timed out after {:?} connecting to {}",
                endpoint.connection_timeout(),
                endpoint.display_addr()
            ))
        })?
        .map_err(|e| {
            RabbitMQError::Connection(format!(
                "failed to connect to {}: {}",
                endpoint.display_addr(),
                e
            ))
        })?;

        Ok(Box::new(LapinConnection { connection }))
    }
}

struct LapinConnection {
    connection: lapin::Connection,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Box<dyn TransportChannel>> {
        let channel = self.connection.create_channel().await?;
        debug!(channel = channel.id(), "lapin channel opened");
        Ok(Box::new(LapinChannel {
            channel,
            consumers: tokio::sync::Mutex::new(SelectAll::new()),
            pending: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(200, "Closing connection").await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

// A `None` payload marks the end of a consumer stream.
type ConsumerItem = (String, Option<lapin::Result<lapin::message::Delivery>>);

struct LapinChannel {
    channel: lapin::Channel,
    consumers: tokio::sync::Mutex<SelectAll<BoxStream<'static, ConsumerItem>>>,
    // Streams registered while a wait holds `consumers`; merged on the next wait.
    pending: parking_lot::Mutex<Vec<BoxStream<'static, ConsumerItem>>>,
}

#[async_trait]
impl TransportChannel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()> {
        self.channel
            .exchange_delete(
                name,
                ExchangeDeleteOptions {
                    if_unused,
                    nowait: false,
                },
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn delete_queue(&self, name: &str, options: QueueDeleteOptions) -> Result<u32> {
        let removed = self
            .channel
            .queue_delete(
                name,
                LapinQueueDeleteOptions {
                    if_unused: options.if_unused,
                    if_empty: options.if_empty,
                    nowait: false,
                },
            )
            .await?;
        Ok(removed)
    }

    async fn purge_queue(&self, name: &str) -> Result<u32> {
        let purged = self
            .channel
            .queue_purge(name, QueuePurgeOptions::default())
            .await?;
        Ok(purged)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                message.body(),
                to_basic_properties(message.properties()),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, options: &ConsumerOptions) -> Result<String> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                to_field_table(&options.arguments),
            )
            .await?;

        let tag = consumer.tag().as_str().to_string();
        let ended_tag = tag.clone();
        let item_tag = tag.clone();
        let stream = consumer
            .map(move |delivery| (item_tag.clone(), Some(delivery)))
            .chain(stream::once(async move { (ended_tag, None) }))
            .boxed();

        match self.consumers.try_lock() {
            Ok(mut consumers) => consumers.push(stream),
            Err(_) => self.pending.lock().push(stream),
        }
        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn fetch_one(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack })
            .await?;
        Ok(message.map(|m| from_lapin_delivery(m.delivery, None)))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn next_event(&self, timeout: Option<Duration>) -> Result<Option<TransportEvent>> {
        let mut consumers = self.consumers.lock().await;
        for stream in self.pending.lock().drain(..) {
            consumers.push(stream);
        }

        let next = async {
            if consumers.is_empty() {
                futures::future::pending::<Option<ConsumerItem>>().await
            } else {
                consumers.next().await
            }
        };

        let item = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, next).await {
                Ok(item) => item,
                Err(_) => return Ok(None),
            },
            None => next.await,
        };

        match item {
            Some((tag, Some(Ok(delivery)))) => Ok(Some(TransportEvent::Delivery(
                from_lapin_delivery(delivery, Some(tag)),
            ))),
            Some((_, Some(Err(e)))) => Err(e.into()),
            Some((tag, None)) => Ok(Some(TransportEvent::ConsumerCancelled(tag))),
            None => Ok(None),
        }
    }

    async fn flow(&self, active: bool) -> Result<bool> {
        Ok(self.channel.channel_flow(ChannelFlowOptions { active }).await?)
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "Closing channel").await?;
        }
        Ok(())
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if !properties.headers.is_empty() {
        basic = basic.with_headers(to_field_table(&properties.headers));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    basic
}

fn from_lapin_delivery(delivery: lapin::message::Delivery, consumer_tag: Option<String>) -> Delivery {
    let props = &delivery.properties;
    let properties = MessageProperties {
        headers: props
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
        reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_string()),
        correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        message_id: props.message_id().as_ref().map(|s| s.as_str().to_string()),
        timestamp: *props.timestamp(),
    };

    Delivery {
        consumer_tag,
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        body: delivery.data,
        properties,
    }
}

fn to_field_table(values: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in values {
        table.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(to_amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(fields) => {
            let nested: BTreeMap<String, Value> =
                fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            AMQPValue::FieldTable(to_field_table(&nested))
        }
    }
}

fn from_field_table(table: &FieldTable) -> BTreeMap<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Number::from_f64(f64::from(*f)).map_or(Value::Null, Value::Number),
        AMQPValue::Double(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => {
            Value::Object(from_field_table(table).into_iter().collect::<Map<_, _>>())
        }
        AMQPValue::Void => Value::Null,
        other => Value::String(format!("{:?}", other)),
    }
}
