// src/rabbitmq/in_memory.rs
//! A broker that lives in the process. It follows RabbitMQ's observable behavior closely
//! enough for the bridge's tests and demos: the four exchange kinds, the default exchange,
//! server-named queues, exclusive and auto-delete cleanup, round-robin consumers,
//! unacknowledged message tracking, channel flow and the usual 404/405/406 refusals.
//! Like RabbitMQ, a refusal closes the channel it happened on.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::EndpointConfig;
use crate::message::{Delivery, Message, MessageProperties};
use crate::messaging::{
    ConsumerOptions, ExchangeKind, ExchangeOptions, QueueDeleteOptions, QueueOptions,
};

use super::amqp_client::{AmqpTransport, TransportChannel, TransportConnection, TransportEvent};
use super::errors::{RabbitMQError, Result};

const NOT_FOUND: u16 = 404;
const ACCESS_REFUSED: u16 = 403;
const RESOURCE_LOCKED: u16 = 405;
const PRECONDITION_FAILED: u16 = 406;
const NOT_ALLOWED: u16 = 530;

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    credentials: Option<(String, String)>,
    refuse_connections: bool,
    connections_opened: usize,
    channels_opened: usize,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelSlot>,
    exchanges: HashMap<String, ExchangeState>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    consumers: HashMap<String, ConsumerState>,
    next_id: u64,
}

struct ChannelSlot {
    connection: u64,
    events: UnboundedSender<TransportEvent>,
    // Pushes to this channel's consumers are held while false.
    flow: bool,
    next_delivery_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

struct ExchangeState {
    kind: ExchangeKind,
    auto_delete: bool,
}

#[derive(Clone, PartialEq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<String>,
    next_consumer: usize,
}

struct ConsumerState {
    queue: String,
    channel: u64,
    no_ack: bool,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

impl Default for BrokerState {
    fn default() -> Self {
        let mut exchanges = HashMap::new();
        for kind in [
            ExchangeKind::Direct,
            ExchangeKind::Topic,
            ExchangeKind::Fanout,
            ExchangeKind::Headers,
        ] {
            exchanges.insert(
                format!("amq.{}", kind),
                ExchangeState {
                    kind,
                    auto_delete: false,
                },
            );
        }

        Self {
            credentials: None,
            refuse_connections: false,
            connections_opened: 0,
            channels_opened: 0,
            connections: HashSet::new(),
            channels: HashMap::new(),
            exchanges,
            bindings: Vec::new(),
            queues: HashMap::new(),
            consumers: HashMap::new(),
            next_id: 1,
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept logins with exactly these credentials.
    pub fn with_credentials(username: &str, password: &str) -> Self {
        let broker = Self::new();
        broker.state.lock().credentials = Some((username.to_string(), password.to_string()));
        broker
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Drops every client connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        let connections: Vec<u64> = state.connections.iter().copied().collect();
        for connection in connections {
            state.close_connection(connection);
        }
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().connections_opened
    }

    pub fn channels_opened(&self) -> usize {
        self.state.lock().channels_opened
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.consumers.len())
    }
}

#[async_trait]
impl AmqpTransport for InMemoryBroker {
    async fn open_connection(
        &self,
        endpoint: &EndpointConfig,
    ) -> Result<Box<dyn TransportConnection>> {
        let mut state = self.state.lock();
        if state.refuse_connections {
            return Err(RabbitMQError::Connection(format!(
                "connection refused by {}",
                endpoint.display_addr()
            )));
        }
        if let Some((username, password)) = &state.credentials {
            if *username != endpoint.username || *password != endpoint.password {
                return Err(RabbitMQError::Connection(format!(
                    "ACCESS_REFUSED - Login was refused for user '{}'",
                    endpoint.username
                )));
            }
        }

        let id = state.next_id();
        state.connections.insert(id);
        state.connections_opened += 1;
        debug!(connection = id, endpoint = %endpoint.display_addr(), "in-memory connection opened");

        Ok(Box::new(InMemoryConnection {
            id,
            state: self.state.clone(),
        }))
    }
}

struct InMemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl TransportConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn TransportChannel>> {
        let mut state = self.state.lock();
        if !state.connections.contains(&self.id) {
            return Err(RabbitMQError::Connection("connection is closed".to_string()));
        }

        let id = state.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        state.channels.insert(
            id,
            ChannelSlot {
                connection: self.id,
                events: tx,
                flow: true,
                next_delivery_tag: 1,
                unacked: HashMap::new(),
            },
        );
        state.channels_opened += 1;

        Ok(Box::new(InMemoryChannel {
            id,
            connection: self.id,
            state: self.state.clone(),
            events: tokio::sync::Mutex::new(rx),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().close_connection(self.id);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connections.contains(&self.id)
    }
}

struct InMemoryChannel {
    id: u64,
    connection: u64,
    state: Arc<Mutex<BrokerState>>,
    events: tokio::sync::Mutex<UnboundedReceiver<TransportEvent>>,
}

impl InMemoryChannel {
    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(state.closed_channel_error(self.connection));
        }

        let result = f(&mut state);
        if let Err(RabbitMQError::BrokerOperation {
            code: Some(code),
            text,
        }) = &result
        {
            match *code {
                ACCESS_REFUSED | NOT_FOUND | RESOURCE_LOCKED | PRECONDITION_FAILED => {
                    debug!(channel = self.id, code = *code, reason = %text, "in-memory channel closed by broker");
                    state.close_channel(self.id);
                }
                NOT_ALLOWED => {
                    debug!(connection = self.connection, reason = %text, "in-memory connection closed by broker");
                    state.close_connection(self.connection);
                }
                _ => {}
            }
        }
        result
    }
}

#[async_trait]
impl TransportChannel for InMemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()> {
        self.with_state(|state| {
            match state.exchanges.get(name) {
                Some(existing) if existing.kind != kind && !options.passive => {
                    Err(RabbitMQError::broker(
                        PRECONDITION_FAILED,
                        format!(
                            "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                            name, kind, existing.kind
                        ),
                    ))
                }
                Some(_) => Ok(()),
                None if options.passive => Err(RabbitMQError::broker(
                    NOT_FOUND,
                    format!("NOT_FOUND - no exchange '{}' in vhost '/'", name),
                )),
                None if name.is_empty() || name.starts_with("amq.") => Err(RabbitMQError::broker(
                    ACCESS_REFUSED,
                    format!("ACCESS_REFUSED - exchange name '{}' contains reserved prefix 'amq.*'", name),
                )),
                None => {
                    state.exchanges.insert(
                        name.to_string(),
                        ExchangeState {
                            kind,
                            auto_delete: options.auto_delete,
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<()> {
        self.with_state(|state| {
            if if_unused && state.bindings.iter().any(|b| b.exchange == name) {
                return Err(RabbitMQError::broker(
                    PRECONDITION_FAILED,
                    format!("PRECONDITION_FAILED - exchange '{}' in vhost '/' in use", name),
                ));
            }
            state.exchanges.remove(name);
            state.bindings.retain(|b| b.exchange != name);
            Ok(())
        })
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let channel = self.id;
        self.with_state(|state| {
            let connection = state.channels[&channel].connection;
            if let Some(existing) = state.queues.get(name) {
                return match existing.owner {
                    Some(owner) if owner != connection => Err(RabbitMQError::broker(
                        RESOURCE_LOCKED,
                        format!(
                            "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}' in vhost '/'",
                            name
                        ),
                    )),
                    _ => Ok(name.to_string()),
                };
            }
            if options.passive {
                return Err(RabbitMQError::broker(
                    NOT_FOUND,
                    format!("NOT_FOUND - no queue '{}' in vhost '/'", name),
                ));
            }

            let name = if name.is_empty() {
                format!("amq.gen-{}", Uuid::new_v4().simple())
            } else {
                name.to_string()
            };
            state.queues.insert(
                name.clone(),
                QueueState {
                    options,
                    owner: options.exclusive.then_some(connection),
                    messages: VecDeque::new(),
                    consumers: Vec::new(),
                    next_consumer: 0,
                },
            );
            trace!(queue = %name, "in-memory queue declared");
            Ok(name)
        })
    }

    async fn delete_queue(&self, name: &str, options: QueueDeleteOptions) -> Result<u32> {
        self.with_state(|state| {
            let Some(queue) = state.queues.get(name) else {
                return Ok(0);
            };
            if options.if_unused && !queue.consumers.is_empty() {
                return Err(RabbitMQError::broker(
                    PRECONDITION_FAILED,
                    format!("PRECONDITION_FAILED - queue '{}' in vhost '/' in use", name),
                ));
            }
            if options.if_empty && !queue.messages.is_empty() {
                return Err(RabbitMQError::broker(
                    PRECONDITION_FAILED,
                    format!("PRECONDITION_FAILED - queue '{}' in vhost '/' not empty", name),
                ));
            }
            Ok(state.delete_queue(name))
        })
    }

    async fn purge_queue(&self, name: &str) -> Result<u32> {
        self.with_state(|state| {
            let queue = state.queue_mut(name)?;
            let purged = queue.messages.len() as u32;
            queue.messages.clear();
            Ok(purged)
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.with_state(|state| {
            if exchange.is_empty() {
                return Err(RabbitMQError::broker(
                    ACCESS_REFUSED,
                    "ACCESS_REFUSED - operation not permitted on the default exchange",
                ));
            }
            if !state.exchanges.contains_key(exchange) {
                return Err(RabbitMQError::broker(
                    NOT_FOUND,
                    format!("NOT_FOUND - no exchange '{}' in vhost '/'", exchange),
                ));
            }
            state.queue_mut(queue)?;

            let binding = Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            };
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        self.with_state(|state| {
            let targets = state.route(exchange, routing_key)?;
            trace!(exchange, routing_key, queues = targets.len(), "in-memory publish");
            for queue in targets {
                state.enqueue(
                    &queue,
                    StoredMessage {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        body: message.body().to_vec(),
                        properties: message.properties().clone(),
                        redelivered: false,
                    },
                );
            }
            Ok(())
        })
    }

    async fn consume(&self, queue: &str, options: &ConsumerOptions) -> Result<String> {
        let channel = self.id;
        self.with_state(|state| {
            state.queue_mut(queue)?;
            let tag = if options.consumer_tag.is_empty() {
                format!("amq.ctag-{}", Uuid::new_v4().simple())
            } else {
                options.consumer_tag.clone()
            };
            if state.consumers.contains_key(&tag) {
                return Err(RabbitMQError::broker(
                    NOT_ALLOWED,
                    format!("NOT_ALLOWED - attempt to reuse consumer tag '{}'", tag),
                ));
            }

            state.consumers.insert(
                tag.clone(),
                ConsumerState {
                    queue: queue.to_string(),
                    channel,
                    no_ack: options.no_ack,
                },
            );
            let queue_state = state.queue_mut(queue)?;
            queue_state.consumers.push(tag.clone());

            let backlog: Vec<StoredMessage> = queue_state.messages.drain(..).collect();
            for message in backlog {
                state.enqueue(queue, message);
            }
            Ok(tag)
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.with_state(|state| {
            state.remove_consumer(consumer_tag);
            Ok(())
        })
    }

    async fn fetch_one(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>> {
        let channel = self.id;
        self.with_state(|state| {
            let Some(message) = state.queue_mut(queue)?.messages.pop_front() else {
                return Ok(None);
            };
            Ok(Some(state.deliver(channel, queue, message, None, no_ack)))
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let channel = self.id;
        self.with_state(|state| {
            state.take_unacked(channel, delivery_tag)?;
            Ok(())
        })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let channel = self.id;
        self.with_state(|state| {
            let (queue, mut message) = state.take_unacked(channel, delivery_tag)?;
            if requeue && state.queues.contains_key(&queue) {
                message.redelivered = true;
                state.enqueue(&queue, message);
            }
            Ok(())
        })
    }

    async fn next_event(&self, timeout: Option<Duration>) -> Result<Option<TransportEvent>> {
        let mut events = self.events.lock().await;
        let event = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, events.recv()).await {
                Ok(event) => event,
                Err(_) => return Ok(None),
            },
            None => events.recv().await,
        };
        match event {
            Some(event) => Ok(Some(event)),
            None => {
                let error = self.state.lock().closed_channel_error(self.connection);
                Err(error)
            }
        }
    }

    async fn flow(&self, active: bool) -> Result<bool> {
        let channel = self.id;
        self.with_state(|state| {
            if let Some(slot) = state.channels.get_mut(&channel) {
                slot.flow = active;
            }
            if active {
                state.resume_channel(channel);
            }
            Ok(active)
        })
    }

    fn is_open(&self) -> bool {
        self.state.lock().channels.contains_key(&self.id)
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().close_channel(self.id);
        Ok(())
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// What an operation on a channel the broker no longer knows reports.
    fn closed_channel_error(&self, connection: u64) -> RabbitMQError {
        if self.connections.contains(&connection) {
            RabbitMQError::BrokerOperation {
                code: None,
                text: "channel is closed".to_string(),
            }
        } else {
            RabbitMQError::Connection("connection is closed".to_string())
        }
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState> {
        self.queues.get_mut(name).ok_or_else(|| {
            RabbitMQError::broker(NOT_FOUND, format!("NOT_FOUND - no queue '{}' in vhost '/'", name))
        })
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .map(|e| e.kind)
            .ok_or_else(|| {
                RabbitMQError::broker(
                    NOT_FOUND,
                    format!("NOT_FOUND - no exchange '{}' in vhost '/'", exchange),
                )
            })?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let routed = match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                // Bindings carry no header arguments, so a headers exchange matches every binding.
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            };
            if routed && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    /// Pushes to the next consumer in turn whose channel has flow, or stores the message
    /// when there is none.
    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        let Some(queue_state) = self.queues.get_mut(queue) else {
            return;
        };

        let count = queue_state.consumers.len();
        let mut target = None;
        for offset in 0..count {
            let index = (queue_state.next_consumer + offset) % count;
            let tag = queue_state.consumers[index].clone();
            let Some(consumer) = self.consumers.get(&tag) else {
                continue;
            };
            if self.channels.get(&consumer.channel).map_or(false, |slot| slot.flow) {
                target = Some((tag, consumer.channel, consumer.no_ack));
                queue_state.next_consumer = index + 1;
                break;
            }
        }
        let Some((tag, channel, no_ack)) = target else {
            queue_state.messages.push_back(message);
            return;
        };
        let delivery = self.deliver(channel, queue, message.clone(), Some(tag), no_ack);
        let delivery_tag = delivery.delivery_tag;
        let sent = match self.channels.get_mut(&channel) {
            Some(slot) => {
                let sent = slot.events.send(TransportEvent::Delivery(delivery)).is_ok();
                if !sent {
                    slot.unacked.remove(&delivery_tag);
                }
                sent
            }
            None => false,
        };
        if !sent {
            if let Some(queue_state) = self.queues.get_mut(queue) {
                queue_state.messages.push_back(message);
            }
        }
    }

    fn deliver(
        &mut self,
        channel: u64,
        queue: &str,
        message: StoredMessage,
        consumer_tag: Option<String>,
        no_ack: bool,
    ) -> Delivery {
        let Some(slot) = self.channels.get_mut(&channel) else {
            return to_delivery(0, consumer_tag, message);
        };
        let delivery_tag = slot.next_delivery_tag;
        slot.next_delivery_tag += 1;
        if !no_ack {
            slot.unacked
                .insert(delivery_tag, (queue.to_string(), message.clone()));
        }
        to_delivery(delivery_tag, consumer_tag, message)
    }

    /// Hands messages that waited while flow was off to the channel's consumers.
    fn resume_channel(&mut self, channel: u64) {
        let queues: HashSet<String> = self
            .consumers
            .values()
            .filter(|c| c.channel == channel)
            .map(|c| c.queue.clone())
            .collect();
        for queue in queues {
            let backlog: Vec<StoredMessage> = match self.queues.get_mut(&queue) {
                Some(queue_state) => queue_state.messages.drain(..).collect(),
                None => continue,
            };
            for message in backlog {
                self.enqueue(&queue, message);
            }
        }
    }

    fn take_unacked(&mut self, channel: u64, delivery_tag: u64) -> Result<(String, StoredMessage)> {
        self.channels
            .get_mut(&channel)
            .and_then(|slot| slot.unacked.remove(&delivery_tag))
            .ok_or_else(|| {
                RabbitMQError::broker(
                    PRECONDITION_FAILED,
                    format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
                )
            })
    }

    fn remove_consumer(&mut self, tag: &str) {
        let Some(consumer) = self.consumers.remove(tag) else {
            return;
        };
        let now_unused = match self.queues.get_mut(&consumer.queue) {
            Some(queue) => {
                queue.consumers.retain(|t| t != tag);
                queue.options.auto_delete && queue.consumers.is_empty()
            }
            None => false,
        };
        if now_unused {
            self.delete_queue(&consumer.queue);
        }
    }

    fn delete_queue(&mut self, name: &str) -> u32 {
        let Some(queue) = self.queues.remove(name) else {
            return 0;
        };
        for tag in &queue.consumers {
            if let Some(consumer) = self.consumers.remove(tag) {
                if let Some(slot) = self.channels.get(&consumer.channel) {
                    let _ = slot
                        .events
                        .send(TransportEvent::ConsumerCancelled(tag.clone()));
                }
            }
        }

        let mut touched: Vec<String> = Vec::new();
        self.bindings.retain(|b| {
            if b.queue == name {
                touched.push(b.exchange.clone());
                false
            } else {
                true
            }
        });
        for exchange in touched {
            let auto_delete = self
                .exchanges
                .get(&exchange)
                .map_or(false, |e| e.auto_delete);
            if auto_delete && !self.bindings.iter().any(|b| b.exchange == exchange) {
                self.exchanges.remove(&exchange);
            }
        }

        trace!(queue = name, "in-memory queue deleted");
        queue.messages.len() as u32
    }

    fn close_channel(&mut self, channel: u64) {
        let Some(slot) = self.channels.remove(&channel) else {
            return;
        };
        let tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.channel == channel)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in tags {
            self.remove_consumer(&tag);
        }

        let mut unacked: Vec<(u64, (String, StoredMessage))> = slot.unacked.into_iter().collect();
        unacked.sort_by_key(|(tag, _)| *tag);
        for (_, (queue, mut message)) in unacked {
            message.redelivered = true;
            self.enqueue(&queue, message);
        }
    }

    fn close_connection(&mut self, connection: u64) {
        if !self.connections.remove(&connection) {
            return;
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, slot)| slot.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue(&queue);
        }
        debug!(connection, "in-memory connection closed");
    }
}

fn to_delivery(delivery_tag: u64, consumer_tag: Option<String>, message: StoredMessage) -> Delivery {
    Delivery {
        consumer_tag,
        delivery_tag,
        exchange: message.exchange,
        routing_key: message.routing_key,
        redelivered: message.redelivered,
        body: message.body,
        properties: message.properties,
    }
}

/// Topic pattern matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && match_words(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && match_words(rest, &words[1..]),
    }
}
