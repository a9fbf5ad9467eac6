use anyhow::{Context, Result};
use async_trait::async_trait;
use rabbitmq_bridge::rabbitmq::{AmqpTransport, LapinTransport};
use rabbitmq_bridge::{
    env, Channel, ConnectionManager, Delivery, DeliveryHandler, ExchangeKind, ExchangeOptions,
    InMemoryBroker, ListenOptions, Message, PollOptions, QueueOptions,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const RPC_EXCHANGE: &str = "rpc";
const ECHO_KEY: &str = "echo";
const ECHO_QUEUE: &str = "rpc.echo";
const JOBS_QUEUE: &str = "demo.jobs";

/// Sends every request body back to its `reply_to`, and stops after `remaining` answers.
struct EchoResponder {
    remaining: usize,
}

#[async_trait]
impl DeliveryHandler for EchoResponder {
    async fn handle(&mut self, channel: &Channel, delivery: Delivery) -> rabbitmq_bridge::Result<()> {
        info!(body = ?delivery.body_str(), "echo request");
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

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = env::load().context("Failed to read RabbitMQ settings from the environment")?;
    let transport: Arc<dyn AmqpTransport> = if env::use_in_memory_broker() {
        info!("Using the in-memory broker");
        Arc::new(InMemoryBroker::new())
    } else {
        Arc::new(LapinTransport::new())
    };
    let manager = ConnectionManager::new(transport.clone());
    let connection = manager.connect(&config.connection).await?;
    // The responder's loop closes its connection when it ends, so it gets one of its own.
    let responders = ConnectionManager::new(transport);
    let responder_connection = responders.connect(&config.connection).await?;

    let control = connection.default_channel().await?;
    control
        .declare_exchange(RPC_EXCHANGE, ExchangeKind::Topic, ExchangeOptions::durable())
        .await?;
    control.declare_queue(ECHO_QUEUE, QueueOptions::default()).await?;
    control.bind_queue(ECHO_QUEUE, RPC_EXCHANGE, ECHO_KEY).await?;

    let responder = responder_connection.channel("responder").await?;
    let listener = tokio::spawn(responder.listen(
        ListenOptions::new(RPC_EXCHANGE, ECHO_KEY)
            .with_queue(ECHO_QUEUE)
            .with_no_ack(config.consume_no_ack),
        EchoResponder { remaining: 1 },
    ));

    let answer = control
        .ask(RPC_EXCHANGE, ECHO_KEY, Message::text("ping")?, config.rpc_timeout())
        .await?;
    info!(answer = %String::from_utf8_lossy(&answer), "RPC answered");

    tokio::select! {
        stopped = listener => stopped.context("Responder task panicked")??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            responders.close_all().await?;
            manager.close_all().await?;
            return Ok(());
        }
    }

    let jobs = connection.channel("jobs").await?;
    jobs.declare_queue(JOBS_QUEUE, QueueOptions::default()).await?;
    for n in 1..=3 {
        let mut headers = BTreeMap::new();
        headers.insert("attempt".to_string(), json!(1));
        jobs.send("", JOBS_QUEUE, json!({ "job": n }), headers, ExchangeKind::Direct)
            .await?;
    }

    jobs.listen_queue(
        JOBS_QUEUE,
        |delivery: Delivery| info!(body = ?delivery.body_str(), "job received"),
        PollOptions::from(&config).stop_when_empty(),
    )
    .await?;

    // The poller closed our connection on its way out; close_all only forgets it now.
    manager.close_all().await?;
    responders.close_all().await?;
    info!("Done");
    Ok(())
}
