// src/rabbitmq/connection.rs
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;

use super::amqp_client::{AmqpTransport, LapinTransport, TransportChannel, TransportConnection};
use super::channel::Channel;
use super::channel_manager::{ChannelRegistry, DEFAULT_CHANNEL};
use super::errors::{RabbitMQError, Result};

/// Owns one physical connection per endpoint. Create it once at the composition root
/// and hand the resulting [`Connection`] handles to whoever needs them.
pub struct ConnectionManager {
    transport: Arc<dyn AmqpTransport>,
    // One cell per endpoint; the map lock is never held while a connection opens.
    connections: parking_lot::Mutex<HashMap<EndpointConfig, Arc<OnceCell<Connection>>>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn AmqpTransport>) -> Self {
        Self {
            transport,
            connections: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn lapin() -> Self {
        Self::new(Arc::new(LapinTransport::new()))
    }

    /// Returns the connection registered for `endpoint`, opening it on first use.
    ///
    /// A registered connection is returned as it is, even if it was closed since; call
    /// [`Connection::reconnect`] to bring it back. Concurrent calls for one endpoint share
    /// a single open; calls for other endpoints do not wait for it.
    pub async fn connect(&self, endpoint: &EndpointConfig) -> Result<Connection> {
        endpoint.validate()?;

        let cell = self
            .connections
            .lock()
            .entry(endpoint.clone())
            .or_default()
            .clone();
        if let Some(existing) = cell.get() {
            debug!(endpoint = %endpoint.display_addr(), "reusing registered connection");
            return Ok(existing.clone());
        }

        let connection = cell
            .get_or_try_init(|| Connection::open(self.transport.clone(), endpoint.clone()))
            .await?;
        Ok(connection.clone())
    }

    pub async fn is_registered(&self, endpoint: &EndpointConfig) -> bool {
        self.connections
            .lock()
            .get(endpoint)
            .map_or(false, |cell| cell.initialized())
    }

    /// Closes and forgets every registered connection. The first failure is returned
    /// after all of them were attempted.
    pub async fn close_all(&self) -> Result<()> {
        let connections: Vec<Connection> = self
            .connections
            .lock()
            .drain()
            .filter_map(|(_, cell)| cell.get().cloned())
            .collect();

        let mut first_error = None;
        for connection in connections {
            if let Err(e) = connection.close().await {
                warn!(endpoint = %connection.endpoint().display_addr(), error = %e, "failed to close connection");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Handle to one physical connection. Clones share the connection and its channels.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    endpoint: EndpointConfig,
    transport: Arc<dyn AmqpTransport>,
    link: RwLock<Option<Arc<dyn TransportConnection>>>,
    // Bumped on close and reconnect; channels remember the value they were opened under.
    generation: AtomicU64,
    lifecycle: Mutex<()>,
    channels: ChannelRegistry,
}

impl Connection {
    async fn open(transport: Arc<dyn AmqpTransport>, endpoint: EndpointConfig) -> Result<Self> {
        let link = open_link(transport.as_ref(), &endpoint).await?;
        info!(endpoint = %endpoint.display_addr(), "connected to RabbitMQ");

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                endpoint,
                transport,
                link: RwLock::new(Some(link)),
                generation: AtomicU64::new(0),
                lifecycle: Mutex::new(()),
                channels: ChannelRegistry::new(),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.inner.endpoint
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Non-blocking liveness check. False once closed, or when the broker dropped the link.
    pub fn is_connected(&self) -> bool {
        self.inner
            .link
            .read()
            .as_ref()
            .map_or(false, |link| link.is_connected())
    }

    /// Returns the channel registered under `id`, opening one if needed.
    pub async fn channel(&self, id: &str) -> Result<Channel> {
        self.inner.channels.acquire(self, id).await
    }

    pub async fn default_channel(&self) -> Result<Channel> {
        self.channel(DEFAULT_CHANNEL).await
    }

    /// Closes and unregisters the channel under `id`.
    pub async fn close_channel(&self, id: &str) -> Result<()> {
        let channel = self.inner.channels.release(id).await?;
        debug!(channel = id, "closing channel");
        channel.shutdown().await
    }

    pub async fn channel_ids(&self) -> Vec<String> {
        self.inner.channels.ids().await
    }

    /// Closes the physical connection. Closing a closed connection does nothing.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let link = self.inner.link.write().take();
        let Some(link) = link else {
            return Ok(());
        };
        self.invalidate_channels().await;

        info!(endpoint = %self.endpoint().display_addr(), "closing connection");
        link.close().await
    }

    /// Replaces the physical connection with a fresh one. Every channel handed out
    /// before becomes invalid and has to be acquired again.
    pub async fn reconnect(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let old = self.inner.link.write().take();
        self.invalidate_channels().await;

        if let Some(old) = old {
            if let Err(e) = old.close().await {
                warn!(endpoint = %self.endpoint().display_addr(), error = %e, "error closing old connection");
            }
        }

        let link = open_link(self.inner.transport.as_ref(), &self.inner.endpoint).await?;
        *self.inner.link.write() = Some(link);
        info!(
            endpoint = %self.endpoint().display_addr(),
            generation = self.generation(),
            "reconnected to RabbitMQ"
        );
        Ok(())
    }

    pub(crate) async fn open_transport_channel(&self) -> Result<(Box<dyn TransportChannel>, u64)> {
        let (link, generation) = {
            let link = self.inner.link.read();
            (link.clone(), self.generation())
        };
        let link = link.ok_or_else(|| {
            RabbitMQError::Connection(format!(
                "connection to {} is closed, reconnect it first",
                self.endpoint().display_addr()
            ))
        })?;
        Ok((link.open_channel().await?, generation))
    }

    /// Drops `channel` from the registry if it is still the registered one.
    pub(crate) async fn forget_channel(&self, channel: &Channel) -> bool {
        self.inner.channels.release_handle(channel).await
    }

    async fn invalidate_channels(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        for channel in self.inner.channels.drain().await {
            channel.invalidate();
        }
    }
}

async fn open_link(
    transport: &dyn AmqpTransport,
    endpoint: &EndpointConfig,
) -> Result<Arc<dyn TransportConnection>> {
    let link = tokio::time::timeout(endpoint.connection_timeout(), transport.open_connection(endpoint))
        .await?
        .map_err(|e| match e {
            RabbitMQError::Connection(_) | RabbitMQError::Configuration(_) => e,
            other => RabbitMQError::Connection(other.to_string()),
        })?;
    Ok(Arc::from(link))
}
