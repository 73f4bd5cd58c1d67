use amqp_relay::rabbitmq::RpcBody;
use amqp_relay::{handler_fn, Message, Publisher, Shutdown, SubscribeOptions, Subscriber};
use anyhow::anyhow;
use serde_json::json;
use std::time::Duration;

use crate::common::{cleanup, connect, raw_channel, unique_queue};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_call_round_trip() {
    let shutdown = Shutdown::new();
    let connection = connect(&shutdown).await;
    let queue = unique_queue("relay-rpc");

    let subscriber = Subscriber::new(
        connection.clone(),
        handler_fn(|body, _| {
            let call: RpcBody = serde_json::from_slice(body)?;
            match call.pattern.as_str() {
                "echo" => Ok(json!({"status": "ok", "echo": call.data})),
                other => Err(anyhow!("unknown pattern {}", other)),
            }
        }),
        SubscribeOptions::new(&queue, true),
        &shutdown,
    );
    subscriber.start().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let publisher = Publisher::new(connection.clone(), &shutdown);

    let message = Message::new(json!({"x": 1}), None).unwrap();
    let pending = publisher.call(&queue, &message, "echo").await.unwrap();
    assert_eq!(pending.correlation_id(), message.id());
    let reply = tokio::time::timeout(REPLY_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(reply.is_disposed);
    assert_eq!(reply.id, message.id());
    assert_eq!(reply.response, Some(json!({"status": "ok", "echo": {"x": 1}})));

    let message = Message::new(json!({}), None).unwrap();
    let pending = publisher.call(&queue, &message, "missing").await.unwrap();
    let reply = tokio::time::timeout(REPLY_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(reply.is_error());
    assert_eq!(reply.err.as_deref(), Some("unknown pattern missing"));
    assert_eq!(publisher.pending_calls(), 0);

    subscriber.stop().await.unwrap();
    let channel = raw_channel(&connection).await;
    cleanup(&channel, &[&queue], &[]).await;
    publisher.close().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_abandoned_call_is_withdrawn() {
    let shutdown = Shutdown::new();
    let connection = connect(&shutdown).await;
    let queue = unique_queue("relay-rpc-idle");
    let channel = raw_channel(&connection).await;
    channel
        .queue_declare(&queue, Default::default(), Default::default())
        .await
        .unwrap();

    let publisher = Publisher::new(connection.clone(), &shutdown);
    let message = Message::new("nobody listens", None).unwrap();
    let pending = publisher.call(&queue, &message, "echo").await.unwrap();
    assert_eq!(publisher.pending_calls(), 1);

    let waited = tokio::time::timeout(Duration::from_millis(200), pending).await;
    assert!(waited.is_err());
    assert_eq!(publisher.pending_calls(), 0);

    cleanup(&channel, &[&queue], &[]).await;
    publisher.close().await.unwrap();
    connection.close().await.unwrap();
}
