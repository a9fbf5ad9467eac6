use async_trait::async_trait;
use rabbitmq_bridge::{
    Channel, Delivery, DeliveryHandler, ExchangeKind, ExchangeOptions, InMemoryBroker,
    ListenOptions, Message, MessageProperties, QueueOptions, RabbitMQError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::common::{connect, responder_connection, EchoResponder};

const RPC: &str = "rpc";

async fn declare_rpc_exchange(channel: &Channel) {
    channel
        .declare_exchange(RPC, ExchangeKind::Topic, ExchangeOptions::durable())
        .await
        .unwrap();
}

async fn declare_request_queue(channel: &Channel, queue: &str, routing_key: &str) {
    channel.declare_queue(queue, QueueOptions::default()).await.unwrap();
    channel.bind_queue(queue, RPC, routing_key).await.unwrap();
}

#[tokio::test]
async fn ask_returns_the_echoed_body() {
    let broker = InMemoryBroker::new();
    let (manager, connection) = connect(&broker).await;
    let requester = connection.channel("requester").await.unwrap();
    declare_rpc_exchange(&requester).await;
    declare_request_queue(&requester, "rpc.echo", "echo").await;

    let responders = responder_connection(&manager).await;
    let responder = responders.channel("responder").await.unwrap();
    let listener = tokio::spawn(responder.listen(
        ListenOptions::new(RPC, "echo").with_queue("rpc.echo"),
        EchoResponder { remaining: 1 },
    ));

    let answer = requester
        .ask(RPC, "echo", Message::text("ping").unwrap(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(answer, b"ping");

    // The reply queue is gone once the answer is in.
    assert!(broker.queue_names().iter().all(|q| !q.starts_with("amq.gen-")));

    // The responder's loop ended with its own connection; the requester's is untouched.
    listener.await.unwrap().unwrap();
    assert!(!responders.is_connected());
    assert!(connection.is_connected());
}

#[tokio::test(start_paused = true)]
async fn ask_without_responder_times_out() {
    let broker = InMemoryBroker::new();
    let (_manager, connection) = connect(&broker).await;
    let channel = connection.default_channel().await.unwrap();
    declare_rpc_exchange(&channel).await;

    let started = Instant::now();
    let result = channel
        .ask(RPC, "echo", Message::text("ping").unwrap(), Duration::from_secs(2))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(RabbitMQError::RpcTimeout(t)) if t == Duration::from_secs(2)));
    assert!(elapsed >= Duration::from_secs(2), "gave up after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "gave up after {:?}", elapsed);

    // Timed out requests clean up after themselves and leave the channel usable.
    assert!(broker.queue_names().is_empty());
    assert!(channel.is_valid());
    assert!(connection.is_connected());
}

#[tokio::test(start_paused = true)]
async fn second_ask_on_a_busy_channel_is_refused() {
    let broker = InMemoryBroker::new();
    let (_manager, connection) = connect(&broker).await;
    let channel = connection.default_channel().await.unwrap();
    declare_rpc_exchange(&channel).await;

    let in_flight = {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .ask(RPC, "slow", Message::text("first").unwrap(), Duration::from_secs(2))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = channel
        .ask(RPC, "slow", Message::text("second").unwrap(), Duration::from_secs(2))
        .await;
    assert!(matches!(second, Err(RabbitMQError::ChannelBusy(id)) if id == "default"));

    assert!(matches!(
        in_flight.await.unwrap(),
        Err(RabbitMQError::RpcTimeout(_))
    ));

    // Free again once the first request finished.
    let third = channel
        .ask(RPC, "slow", Message::text("third").unwrap(), Duration::from_millis(100))
        .await;
    assert!(matches!(third, Err(RabbitMQError::RpcTimeout(_))));
}

/// Sends a stray answer with a foreign correlation id before the real one.
struct NoisyResponder;

#[async_trait]
impl DeliveryHandler for NoisyResponder {
    async fn handle(&mut self, channel: &Channel, delivery: Delivery) -> rabbitmq_bridge::Result<()> {
        let reply_to = delivery.reply_to().unwrap_or_default().to_string();
        let stray = Message::text("not yours")?.with_properties(
            MessageProperties::default().with_correlation_id("someone-else"),
        );
        channel.publish(&delivery.exchange, &reply_to, &stray).await?;

        channel
            .reply(&delivery, Message::from_bytes(delivery.body.clone())?)
            .await?;
        if let Some(tag) = &delivery.consumer_tag {
            channel.cancel(tag).await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn replies_for_other_requests_are_ignored() {
    let broker = InMemoryBroker::new();
    let (manager, connection) = connect(&broker).await;
    let requester = connection.channel("requester").await.unwrap();
    declare_rpc_exchange(&requester).await;
    declare_request_queue(&requester, "rpc.noisy", "noisy").await;

    let responders = responder_connection(&manager).await;
    let responder = responders.channel("responder").await.unwrap();
    let listener = tokio::spawn(responder.listen(
        ListenOptions::new(RPC, "noisy").with_queue("rpc.noisy"),
        NoisyResponder,
    ));

    let answer = requester
        .ask(RPC, "noisy", Message::text("mine").unwrap(), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(answer, b"mine");
    listener.await.unwrap().unwrap();
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct StockQuery {
    sku: String,
}

#[tokio::test]
async fn ask_json_round_trips_typed_payloads() {
    let broker = InMemoryBroker::new();
    let (manager, connection) = connect(&broker).await;
    let requester = connection.channel("requester").await.unwrap();
    declare_rpc_exchange(&requester).await;
    declare_request_queue(&requester, "rpc.stock", "stock").await;

    let responders = responder_connection(&manager).await;
    let responder = responders.channel("responder").await.unwrap();
    let listener = tokio::spawn(responder.listen(
        ListenOptions::new(RPC, "stock").with_queue("rpc.stock"),
        EchoResponder { remaining: 1 },
    ));

    let query = StockQuery {
        sku: "A-100".to_string(),
    };
    let echoed: StockQuery = requester
        .ask_json(RPC, "stock", &query, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(echoed, query);
    listener.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn lost_connection_during_ask_tears_everything_down() {
    let broker = InMemoryBroker::new();
    let (_manager, connection) = connect(&broker).await;
    let channel = connection.default_channel().await.unwrap();
    declare_rpc_exchange(&channel).await;

    let outage = {
        let broker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            broker.drop_connections();
        })
    };

    let result = channel
        .ask(RPC, "echo", Message::text("ping").unwrap(), Duration::from_secs(2))
        .await;
    outage.await.unwrap();

    assert!(matches!(result, Err(RabbitMQError::Connection(_))));
    assert!(!channel.is_valid());
    assert!(!connection.is_connected());
    assert!(connection.channel_ids().await.is_empty());
}

#[tokio::test]
async fn ask_on_a_stale_channel_is_invalid() {
    let broker = InMemoryBroker::new();
    let (_manager, connection) = connect(&broker).await;
    let channel = connection.default_channel().await.unwrap();
    connection.reconnect().await.unwrap();

    let result = channel
        .ask(RPC, "echo", Message::text("ping").unwrap(), Duration::from_secs(2))
        .await;

    assert!(matches!(result, Err(RabbitMQError::ChannelInvalid(_))));
    assert!(connection.is_connected());
}

#[tokio::test]
async fn refused_ask_leaves_a_replaceable_channel() {
    let broker = InMemoryBroker::new();
    let (_manager, connection) = connect(&broker).await;
    let channel = connection.channel("client").await.unwrap();

    let refused = channel
        .ask("nowhere", "echo", Message::text("ping").unwrap(), Duration::from_secs(1))
        .await;
    assert!(matches!(
        refused,
        Err(RabbitMQError::BrokerOperation { code: Some(404), .. })
    ));
    assert!(!channel.is_valid());
    assert!(connection.is_connected());

    let fresh = connection.channel("client").await.unwrap();
    assert!(!fresh.same_channel(&channel));
    declare_rpc_exchange(&fresh).await;
    assert!(matches!(
        channel.publish(RPC, "echo", &Message::text("late").unwrap()).await,
        Err(RabbitMQError::ChannelInvalid(id)) if id == "client"
    ));
    assert_eq!(broker.channels_opened(), 2);
}
