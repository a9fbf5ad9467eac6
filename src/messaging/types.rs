// src/messaging/types.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Routing behavior of an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Headers,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            passive: false,
            durable: false,
            auto_delete: true,
            internal: false,
        }
    }
}

impl ExchangeOptions {
    /// Durable, never auto-deleted. Used when a send or listen declares the exchange itself.
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            passive: false,
            durable: false,
            auto_delete: true,
            exclusive: false,
        }
    }
}

impl QueueOptions {
    /// Private, transient queue for replies.
    pub fn reply() -> Self {
        Self {
            passive: false,
            durable: false,
            auto_delete: true,
            exclusive: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDeleteOptions {
    pub if_unused: bool,
    pub if_empty: bool,
}

/// Options for a consumer registration. An empty `consumer_tag` lets the broker pick one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerOptions {
    pub consumer_tag: String,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub arguments: BTreeMap<String, Value>,
}

impl ConsumerOptions {
    pub fn no_ack(no_ack: bool) -> Self {
        Self {
            no_ack,
            ..Self::default()
        }
    }
}
