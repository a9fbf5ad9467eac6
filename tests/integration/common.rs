use async_trait::async_trait;
use parking_lot::Mutex;
use rabbitmq_bridge::config::EndpointConfig;
use rabbitmq_bridge::{
    Channel, Connection, ConnectionManager, Delivery, DeliveryHandler, InMemoryBroker, Message,
};
use std::sync::Arc;

pub fn endpoint() -> EndpointConfig {
    EndpointConfig::default()
}

pub async fn connect(broker: &InMemoryBroker) -> (ConnectionManager, Connection) {
    let manager = ConnectionManager::new(Arc::new(broker.clone()));
    let connection = manager.connect(&endpoint()).await.unwrap();
    (manager, connection)
}

/// A second connection on the same broker, for responders whose loops close it.
pub async fn responder_connection(manager: &ConnectionManager) -> Connection {
    manager
        .connect(&endpoint().with_vhost("responders"))
        .await
        .unwrap()
}

/// Shared log of delivered bodies, usable from a `'static` handler.
#[derive(Clone, Default)]
pub struct Received {
    bodies: Arc<Mutex<Vec<String>>>,
    tags: Arc<Mutex<Vec<String>>>,
}

impl Received {
    pub fn handler(&self) -> impl FnMut(Delivery) + Send + 'static {
        let received = self.clone();
        move |delivery: Delivery| {
            if let Some(tag) = &delivery.consumer_tag {
                received.tags.lock().push(tag.clone());
            }
            received
                .bodies
                .lock()
                .push(String::from_utf8_lossy(&delivery.body).into_owned());
        }
    }

    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().clone()
    }

    pub fn last_consumer_tag(&self) -> Option<String> {
        self.tags.lock().last().cloned()
    }
}

/// Answers each request with its own body and cancels itself after `remaining` answers.
pub struct EchoResponder {
    pub remaining: usize,
}

#[async_trait]
impl DeliveryHandler for EchoResponder {
    async fn handle(&mut self, channel: &Channel, delivery: Delivery) -> rabbitmq_bridge::Result<()> {
        channel
            .reply(&delivery, Message::from_bytes(delivery.body.clone())?)
            .await?;
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            if let Some(tag) = &delivery.consumer_tag {
                channel.cancel(tag).await?;
            }
        }
        Ok(())
    }
}

/// Yields until `condition` holds, so spawned loops can reach their next wait.
pub async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
