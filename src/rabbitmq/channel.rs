// src/rabbitmq/channel.rs
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use crate::message::Delivery;

use super::amqp_client::{TransportChannel, TransportEvent};
use super::connection::{Connection, ConnectionInner};
use super::consumer::DeliveryHandler;
use super::errors::{RabbitMQError, Result};

/// A logical channel handed out by [`Connection::channel`].
///
/// Clones share the same transport channel and consumer registrations. Every operation
/// first checks that the channel is still valid: releasing it, closing or reconnecting
/// its connection, or the broker closing it after a refused operation, makes all handles
/// fail with [`RabbitMQError::ChannelInvalid`].
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: String,
    transport: Box<dyn TransportChannel>,
    connection: Weak<ConnectionInner>,
    generation: u64,
    closed: AtomicBool,
    // `None` while the handler is running.
    registrations: Mutex<HashMap<String, Option<Box<dyn DeliveryHandler>>>>,
    // Deliveries that arrived while their consumer's handler was running, in arrival order.
    held: Mutex<VecDeque<Delivery>>,
    wake: Notify,
    rpc_in_flight: AtomicBool,
}

impl Channel {
    pub(crate) fn new(
        id: &str,
        transport: Box<dyn TransportChannel>,
        connection: &Connection,
        generation: u64,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id: id.to_string(),
                transport,
                connection: connection.downgrade(),
                generation,
                closed: AtomicBool::new(false),
                registrations: Mutex::new(HashMap::new()),
                held: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                rpc_in_flight: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The connection this channel was opened on, while it is still alive.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.connection.upgrade().map(Connection::from_inner)
    }

    pub fn is_valid(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
            && self.inner.transport.is_open()
            && self
                .connection()
                .map_or(false, |c| c.generation() == self.inner.generation)
    }

    /// True when both handles refer to the same transport channel.
    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn transport(&self) -> Result<&dyn TransportChannel> {
        if self.is_valid() {
            Ok(self.inner.transport.as_ref())
        } else {
            Err(self.invalid_error())
        }
    }

    /// A link that dropped under a current channel is a connection error, so loops tear
    /// down. Anything else means the channel has to be acquired again.
    fn invalid_error(&self) -> RabbitMQError {
        let link_lost = !self.inner.closed.load(Ordering::SeqCst)
            && self.connection().map_or(false, |c| {
                c.generation() == self.inner.generation && !c.is_connected()
            });
        if link_lost {
            RabbitMQError::Connection(format!(
                "connection of channel '{}' was lost",
                self.inner.id
            ))
        } else {
            RabbitMQError::ChannelInvalid(self.inner.id.clone())
        }
    }

    /// Registers `handler` for deliveries from `queue` and returns the consumer tag.
    /// Deliveries are handed to the handler from [`Channel::wait`].
    pub async fn consume<H>(
        &self,
        queue: &str,
        options: &crate::messaging::ConsumerOptions,
        handler: H,
    ) -> Result<String>
    where
        H: DeliveryHandler + 'static,
    {
        let tag = self.transport()?.consume(queue, options).await?;
        self.inner
            .registrations
            .lock()
            .insert(tag.clone(), Some(Box::new(handler)));
        self.inner.wake.notify_one();
        debug!(channel = %self.inner.id, queue, consumer_tag = %tag, "consumer registered");
        Ok(tag)
    }

    /// Removes a consumer registration. Safe to call from inside a handler and from any
    /// clone of this channel; a running wait notices on its next iteration.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let transport = self.transport()?;
        let removed = self.inner.registrations.lock().remove(consumer_tag).is_some();
        self.inner.wake.notify_one();
        if removed {
            debug!(channel = %self.inner.id, consumer_tag, "consumer cancelled");
        }
        transport.cancel(consumer_tag).await
    }

    /// Pauses (`false`) or resumes (`true`) the deliveries pushed to this channel and
    /// returns the state the broker confirmed. RabbitMQ does not implement pausing on a
    /// client's request and answers it with a connection error.
    pub async fn set_flow(&self, active: bool) -> Result<bool> {
        let confirmed = self.transport()?.flow(active).await?;
        debug!(channel = %self.inner.id, active = confirmed, "channel flow changed");
        Ok(confirmed)
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.registrations.lock().len()
    }

    pub fn has_consumers(&self) -> bool {
        self.consumer_count() > 0
    }

    /// Waits for one event from the broker and dispatches it to its consumer.
    ///
    /// Deliveries that arrived for a consumer while its handler was itself waiting on this
    /// channel (say, for an [`ask`](Channel::ask)) are held and dispatched first, in arrival
    /// order, once that handler has returned.
    ///
    /// Returns `Ok(false)` when `timeout` elapsed, or when the wait was interrupted by a
    /// registration change, without anything being dispatched.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let transport = self.transport()?;
        let held = self.next_held();
        if let Some(delivery) = held {
            self.dispatch(delivery).await?;
            return Ok(true);
        }

        let event = tokio::select! {
            biased;
            _ = self.inner.wake.notified() => return Ok(false),
            event = transport.next_event(timeout) => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(e) if !e.is_fatal() && !self.is_valid() => return Err(self.invalid_error()),
            Err(e) => return Err(e),
        };

        match event {
            None => Ok(false),
            Some(TransportEvent::ConsumerCancelled(tag)) => {
                self.inner.registrations.lock().remove(&tag);
                debug!(channel = %self.inner.id, consumer_tag = %tag, "consumer cancelled by broker");
                Ok(true)
            }
            Some(TransportEvent::Delivery(delivery)) => {
                self.dispatch(delivery).await?;
                Ok(true)
            }
        }
    }

    async fn dispatch(&self, delivery: Delivery) -> Result<()> {
        let Some(tag) = delivery.consumer_tag.clone() else {
            return Ok(());
        };
        let mut handler = {
            let mut registrations = self.inner.registrations.lock();
            let Some(slot) = registrations.get_mut(&tag) else {
                debug!(channel = %self.inner.id, consumer_tag = %tag, "dropping delivery for cancelled consumer");
                return Ok(());
            };
            let mut held = self.inner.held.lock();
            let behind = held
                .iter()
                .any(|d| d.consumer_tag.as_deref() == Some(tag.as_str()));
            match slot.take() {
                Some(handler) if !behind => handler,
                taken => {
                    *slot = taken;
                    trace!(channel = %self.inner.id, consumer_tag = %tag, "consumer busy, holding delivery");
                    held.push_back(delivery);
                    return Ok(());
                }
            }
        };

        let result = handler.handle(self, delivery).await;

        let mut registrations = self.inner.registrations.lock();
        if let Some(slot @ None) = registrations.get_mut(&tag) {
            *slot = Some(handler);
        }
        result
    }

    /// Oldest held delivery whose consumer is free again.
    fn next_held(&self) -> Option<Delivery> {
        let registrations = self.inner.registrations.lock();
        let mut held = self.inner.held.lock();
        held.retain(|delivery| {
            let registered = delivery
                .consumer_tag
                .as_ref()
                .map_or(false, |tag| registrations.contains_key(tag));
            if !registered {
                warn!(
                    channel = %self.inner.id,
                    delivery_tag = delivery.delivery_tag,
                    "consumer cancelled before its held delivery could be handled"
                );
            }
            registered
        });
        let index = held.iter().position(|delivery| {
            delivery
                .consumer_tag
                .as_ref()
                .and_then(|tag| registrations.get(tag))
                .map_or(false, Option::is_some)
        })?;
        held.remove(index)
    }

    /// Marks this channel as being used by an RPC; `None` when one is already running.
    pub(crate) fn begin_rpc(&self) -> Option<RpcGuard> {
        self.inner
            .rpc_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RpcGuard {
                inner: self.inner.clone(),
            })
    }

    /// Makes every handle of this channel invalid without talking to the broker.
    pub(crate) fn invalidate(&self) -> bool {
        let first = !self.inner.closed.swap(true, Ordering::SeqCst);
        self.inner.registrations.lock().clear();
        self.inner.held.lock().clear();
        self.inner.wake.notify_one();
        first
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        if self.invalidate() && self.inner.transport.is_open() {
            self.inner.transport.close().await
        } else {
            Ok(())
        }
    }

    /// Releases the channel and closes its connection. Loops end here, whatever the outcome.
    pub(crate) async fn teardown(&self) {
        let connection = self.connection();
        let current = connection
            .as_ref()
            .map_or(false, |c| c.generation() == self.inner.generation);

        if let Some(connection) = connection.as_ref() {
            connection.forget_channel(self).await;
        }
        if let Err(e) = self.shutdown().await {
            warn!(channel = %self.inner.id, error = %e, "failed to close channel");
        }
        // A reconnect since this channel was opened means the link is no longer ours to close.
        if let (Some(connection), true) = (connection, current) {
            if let Err(e) = connection.close().await {
                warn!(channel = %self.inner.id, error = %e, "failed to close connection");
            }
        }
    }

    /// Tears everything down when `error` means the link is gone.
    pub(crate) async fn fail(&self, error: RabbitMQError) -> RabbitMQError {
        if error.is_fatal() {
            error!(channel = %self.inner.id, error = %error, "fatal transport error");
            self.teardown().await;
        }
        error
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("generation", &self.inner.generation)
            .field("valid", &self.is_valid())
            .finish()
    }
}

pub(crate) struct RpcGuard {
    inner: Arc<ChannelInner>,
}

impl Drop for RpcGuard {
    fn drop(&mut self) {
        self.inner.rpc_in_flight.store(false, Ordering::SeqCst);
    }
}
