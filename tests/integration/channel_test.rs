use rabbitmq_bridge::{InMemoryBroker, QueueOptions, RabbitMQError, DEFAULT_CHANNEL};

use crate::common::connect;

#[tokio::test]
async fn same_id_returns_the_same_channel() {
    let broker = InMemoryBroker::new();
    let (_manager, connection) = connect(&broker).await;

    let first = connection.channel("orders").await.unwrap();
    let second = connection.channel("orders").await.unwrap();
    assert!(first.same_channel(&second));
    assert_eq!(broker.channels_opened(), 1);

    let default = connection.default_channel().await.unwrap();
    let empty = connection.channel("").await.unwrap();
    assert_eq!(default.id(), DEFAULT_CHANNEL);
    assert!(!default.same_channel(&empty));
    assert_eq!(broker.channels_opened(), 3);
    assert_eq!(connection.channel_ids().await, vec!["", "default", "orders"]);
}

#[tokio::test]
async fn concurrent_acquire_opens_one_channel() {
    let broker = InMemoryBroker::new();
    let (_manager, connection) = connect(&broker).await;

    let (a, b) = tokio::join!(connection.channel("shared"), connection.channel("shared"));

    assert!(a.unwrap().same_channel(&b.unwrap()));
    assert_eq!(broker.channels_opened(), 1);
}

#[tokio::test]
async fn closing_an_unknown_channel_fails_without_side_effects() {
    let broker = InMemoryBroker::new();
    let (_manager, connection) = connect(&broker).await;
    let orders = connection.channel("orders").await.unwrap();

    let result = connection.close_channel("billing").await;

    assert!(matches!(result, Err(RabbitMQError::UnknownChannel(id)) if id == "billing"));
    assert!(orders.is_valid());
    assert_eq!(connection.channel_ids().await, vec!["orders"]);
}

#[tokio::test]
async fn closed_channel_handles_become_invalid() {
    let broker = InMemoryBroker::new();
    let (_manager, connection) = connect(&broker).await;
    let orders = connection.channel("orders").await.unwrap();

    connection.close_channel("orders").await.unwrap();

    let result = orders.declare_queue("jobs", QueueOptions::default()).await;
    assert!(matches!(result, Err(RabbitMQError::ChannelInvalid(_))));
    assert_eq!(broker.open_channels(), 0);
    assert!(matches!(
        connection.close_channel("orders").await,
        Err(RabbitMQError::UnknownChannel(_))
    ));

    let reopened = connection.channel("orders").await.unwrap();
    assert!(!reopened.same_channel(&orders));
    reopened.declare_queue("jobs", QueueOptions::default()).await.unwrap();
}

#[tokio::test]
async fn reconnect_invalidates_issued_channels() {
    let broker = InMemoryBroker::new();
    let (_manager, connection) = connect(&broker).await;
    let stale = connection.channel("orders").await.unwrap();
    let stale_clone = stale.clone();

    connection.reconnect().await.unwrap();

    for handle in [&stale, &stale_clone] {
        let result = handle.declare_queue("jobs", QueueOptions::default()).await;
        assert!(matches!(result, Err(RabbitMQError::ChannelInvalid(id)) if id == "orders"));
    }
    assert!(connection.channel_ids().await.is_empty());

    let fresh = connection.channel("orders").await.unwrap();
    assert!(fresh.is_valid());
    assert!(!fresh.same_channel(&stale));
    fresh.declare_queue("jobs", QueueOptions::default()).await.unwrap();
}

#[tokio::test]
async fn channels_of_a_closed_connection_are_invalid() {
    let broker = InMemoryBroker::new();
    let (_manager, connection) = connect(&broker).await;
    let orders = connection.channel("orders").await.unwrap();

    connection.close().await.unwrap();

    assert!(!orders.is_valid());
    assert!(matches!(
        orders.purge_queue("jobs").await,
        Err(RabbitMQError::ChannelInvalid(_))
    ));
    assert!(matches!(
        connection.channel("orders").await,
        Err(RabbitMQError::Connection(_))
    ));
}
