// src/rabbitmq/channel_manager.rs
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::channel::Channel;
use super::connection::Connection;
use super::errors::{RabbitMQError, Result};

/// Identifier used when the caller does not name a channel.
pub const DEFAULT_CHANNEL: &str = "default";

/// Named channels of one connection. At most one live transport channel per identifier.
pub(crate) struct ChannelRegistry {
    // Held across the open so two callers asking for the same id share one channel.
    entries: Mutex<HashMap<String, Channel>>,
}

impl ChannelRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn acquire(&self, connection: &Connection, id: &str) -> Result<Channel> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(id) {
            if existing.is_valid() {
                return Ok(existing.clone());
            }
            existing.invalidate();
            debug!(channel = id, "replacing stale channel");
        }

        let (transport, generation) = connection.open_transport_channel().await?;
        let channel = Channel::new(id, transport, connection, generation);
        entries.insert(id.to_string(), channel.clone());
        debug!(channel = id, generation, "channel opened");
        Ok(channel)
    }

    /// Unregisters `id` and returns its handle so the caller can close it.
    pub(crate) async fn release(&self, id: &str) -> Result<Channel> {
        self.entries
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| RabbitMQError::UnknownChannel(id.to_string()))
    }

    /// Unregisters `channel` only if it is still the entry for its id.
    pub(crate) async fn release_handle(&self, channel: &Channel) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(channel.id()) {
            Some(current) if current.same_channel(channel) => {
                entries.remove(channel.id());
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn drain(&self) -> Vec<Channel> {
        self.entries.lock().await.drain().map(|(_, ch)| ch).collect()
    }

    pub(crate) async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
