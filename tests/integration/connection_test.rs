use async_trait::async_trait;
use rabbitmq_bridge::config::{load_config_from, EndpointConfig};
use rabbitmq_bridge::rabbitmq::{AmqpTransport, TransportConnection};
use rabbitmq_bridge::{ConnectionManager, InMemoryBroker, RabbitMQError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{connect, endpoint};

#[tokio::test]
async fn connect_opens_one_connection_per_endpoint() {
    let broker = InMemoryBroker::new();
    let manager = ConnectionManager::new(Arc::new(broker.clone()));

    let first = manager.connect(&endpoint()).await.unwrap();
    let second = manager.connect(&endpoint()).await.unwrap();
    assert_eq!(broker.connections_opened(), 1);

    let other_vhost = endpoint().with_vhost("orders");
    manager.connect(&other_vhost).await.unwrap();
    assert_eq!(broker.connections_opened(), 2);

    assert!(first.is_connected() && second.is_connected());
}

#[tokio::test]
async fn empty_username_fails_before_any_network_call() {
    let broker = InMemoryBroker::new();
    let manager = ConnectionManager::new(Arc::new(broker.clone()));

    let result = manager
        .connect(&EndpointConfig::new("localhost", 5672, "", "guest"))
        .await;

    assert!(matches!(result, Err(RabbitMQError::Configuration(_))));
    assert_eq!(broker.connections_opened(), 0);
}

#[tokio::test]
async fn refused_login_is_a_connection_error() {
    let broker = InMemoryBroker::with_credentials("app", "secret");
    let manager = ConnectionManager::new(Arc::new(broker.clone()));

    let result = manager
        .connect(&EndpointConfig::new("localhost", 5672, "app", "wrong"))
        .await;
    assert!(matches!(result, Err(RabbitMQError::Connection(_))));

    let accepted = manager
        .connect(&EndpointConfig::new("localhost", 5672, "app", "secret"))
        .await;
    assert!(accepted.is_ok());
}

#[tokio::test]
async fn unreachable_broker_is_a_connection_error() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(true);
    let manager = ConnectionManager::new(Arc::new(broker.clone()));

    let result = manager.connect(&endpoint()).await;

    assert!(matches!(result, Err(RabbitMQError::Connection(_))));
    assert!(!manager.is_registered(&endpoint()).await);
}

/// The in-memory broker, except that connecting to `slow_host` hangs for a minute.
struct SlowHost {
    broker: InMemoryBroker,
    slow_host: &'static str,
}

#[async_trait]
impl AmqpTransport for SlowHost {
    async fn open_connection(
        &self,
        endpoint: &EndpointConfig,
    ) -> rabbitmq_bridge::Result<Box<dyn TransportConnection>> {
        if endpoint.host == self.slow_host {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.broker.open_connection(endpoint).await
    }
}

#[tokio::test(start_paused = true)]
async fn slow_endpoint_does_not_hold_up_other_endpoints() {
    let broker = InMemoryBroker::new();
    let manager = Arc::new(ConnectionManager::new(Arc::new(SlowHost {
        broker: broker.clone(),
        slow_host: "blackhole",
    })));
    let slow_endpoint = EndpointConfig::new("blackhole", 5672, "guest", "guest");

    let slow = {
        let manager = manager.clone();
        let endpoint = slow_endpoint.clone();
        tokio::spawn(async move { manager.connect(&endpoint).await.map(|_| ()) })
    };
    tokio::task::yield_now().await;

    let fast = tokio::time::timeout(Duration::from_millis(100), manager.connect(&endpoint())).await;
    assert!(matches!(fast, Ok(Ok(_))));
    assert!(manager.is_registered(&endpoint()).await);

    // Gives up at the connection timeout and leaves nothing behind.
    assert!(matches!(slow.await.unwrap(), Err(RabbitMQError::Connection(_))));
    assert!(!manager.is_registered(&slow_endpoint).await);
    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test]
async fn concurrent_connects_to_one_endpoint_share_the_connection() {
    let broker = InMemoryBroker::new();
    let manager = ConnectionManager::new(Arc::new(broker.clone()));

    let (ep1, ep2) = (endpoint(), endpoint());
    let (first, second) = tokio::join!(manager.connect(&ep1), manager.connect(&ep2));

    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(first.is_connected() && second.is_connected());
    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test]
async fn close_twice_is_not_an_error() {
    let broker = InMemoryBroker::new();
    let (manager, connection) = connect(&broker).await;

    connection.close().await.unwrap();
    connection.close().await.unwrap();
    assert!(!connection.is_connected());

    // Still registered, and handed back as it is.
    let again = manager.connect(&endpoint()).await.unwrap();
    assert!(!again.is_connected());
    assert_eq!(broker.connections_opened(), 1);

    again.reconnect().await.unwrap();
    assert!(connection.is_connected());
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test]
async fn liveness_check_reports_a_dropped_link() {
    let broker = InMemoryBroker::new();
    let (_manager, connection) = connect(&broker).await;
    assert!(connection.is_connected());

    broker.drop_connections();

    assert!(!connection.is_connected());
    connection.reconnect().await.unwrap();
    assert!(connection.is_connected());
}

#[tokio::test]
async fn close_all_closes_every_connection() {
    let broker = InMemoryBroker::new();
    let manager = ConnectionManager::new(Arc::new(broker.clone()));
    let first = manager.connect(&endpoint()).await.unwrap();
    let second = manager.connect(&endpoint().with_vhost("orders")).await.unwrap();

    manager.close_all().await.unwrap();

    assert!(!first.is_connected());
    assert!(!second.is_connected());
    assert!(!manager.is_registered(&endpoint()).await);
}

#[test]
fn test_config_fixture_loads() {
    let config = load_config_from(Path::new("tests/fixtures/rabbitmq/configs/test_config.json")).unwrap();

    assert_eq!(config.connection.username, "user_rust");
    assert_eq!(config.connection.vhost, "vhost_rust");
    assert_eq!(config.connection.options.heartbeat_seconds, Some(30));
    assert_eq!(config.rpc_timeout_ms, 2000);
}

#[tokio::test]
#[ignore] // Needs a running RabbitMQ matching tests/fixtures/rabbitmq/configs/test_config.json
async fn test_connection_establishes() {
    let config = load_config_from(Path::new("tests/fixtures/rabbitmq/configs/test_config.json")).unwrap();
    let manager = ConnectionManager::lapin();

    let connection = manager.connect(&config.connection).await.unwrap();
    let channel = connection.default_channel().await.unwrap();
    let queue = channel
        .declare_queue("", rabbitmq_bridge::QueueOptions::reply())
        .await
        .unwrap();

    assert!(queue.starts_with("amq.gen-"));
    manager.close_all().await.unwrap();
}
