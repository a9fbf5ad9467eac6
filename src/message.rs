use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::rabbitmq::errors::{RabbitMQError, Result};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP basic properties the bridge understands.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageProperties {
    /// Application headers.
    pub headers: BTreeMap<String, Value>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the unix epoch.
    pub timestamp: Option<u64>,
}

impl MessageProperties {
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, Value>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// An outgoing message. Only constructible with a non-empty body.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    body: Vec<u8>,
    properties: MessageProperties,
}

impl Message {
    pub fn text(body: impl Into<String>) -> Result<Self> {
        prepare_message(Value::String(body.into()), MessageProperties::default())
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        prepare_message(serde_json::to_value(value)?, MessageProperties::default())
    }

    /// Raw body, sent as-is.
    pub fn from_bytes(body: impl Into<Vec<u8>>) -> Result<Self> {
        let body = body.into();
        if body.is_empty() {
            return Err(RabbitMQError::EmptyMessage);
        }
        Ok(Self {
            body,
            properties: MessageProperties::default(),
        })
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut MessageProperties {
        &mut self.properties
    }
}

/// Builds an outgoing message, rejecting empty bodies before any network call.
///
/// Strings pass through unchanged. Arrays and objects are encoded as compact JSON and
/// tagged `application/json` unless the caller set a content type. Numbers and booleans
/// are sent as their JSON text.
pub fn prepare_message(body: Value, properties: MessageProperties) -> Result<Message> {
    let mut properties = properties;
    let body = match body {
        Value::Null => return Err(RabbitMQError::EmptyMessage),
        Value::String(text) if text.is_empty() => return Err(RabbitMQError::EmptyMessage),
        Value::Array(items) if items.is_empty() => return Err(RabbitMQError::EmptyMessage),
        Value::Object(fields) if fields.is_empty() => return Err(RabbitMQError::EmptyMessage),
        Value::String(text) => text.into_bytes(),
        structured @ (Value::Array(_) | Value::Object(_)) => {
            if properties.content_type.is_none() {
                properties.content_type = Some(JSON_CONTENT_TYPE.to_string());
            }
            serde_json::to_vec(&structured)?
        }
        scalar => scalar.to_string().into_bytes(),
    };

    Ok(Message { body, properties })
}

/// A message handed to a consumer or returned by a single fetch.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    /// Set for pushed deliveries, absent for fetched ones.
    pub consumer_tag: Option<String>,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl Delivery {
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }
}
