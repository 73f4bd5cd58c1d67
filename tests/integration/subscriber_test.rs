use amqp_relay::rabbitmq::outcome::{DEATH_QUEUE_HEADER, RETRY_COUNT_HEADER};
use amqp_relay::{
    handler_fn, Message, Publisher, RetryStrategy, Shutdown, SubscribeOptions, Subscriber,
};
use anyhow::anyhow;
use lapin::options::BasicGetOptions;
use lapin::types::{AMQPValue, ShortString};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{cleanup, connect, eventually, raw_channel, unique_queue};

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_messages_are_handled_and_acked() {
    let shutdown = Shutdown::new();
    let connection = connect(&shutdown).await;
    let queue = unique_queue("relay-ok");

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let subscriber = Subscriber::new(
        connection.clone(),
        handler_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }),
        SubscribeOptions::new(&queue, false).with_workers(2, 4),
        &shutdown,
    );
    subscriber.start().unwrap();
    let sub = &subscriber;
    let ready = eventually(Duration::from_secs(5), || async move {
        (sub.running_workers() == 2).then_some(())
    })
    .await;
    assert!(ready.is_some());

    let publisher = Publisher::new(connection.clone(), &shutdown);
    for n in 0..5 {
        let message = Message::new(json!({"n": n}), None).unwrap();
        publisher.publish(&queue, &message).await.unwrap();
    }

    let seen = &handled;
    let all = eventually(Duration::from_secs(10), || async move {
        (seen.load(Ordering::SeqCst) == 5).then_some(())
    })
    .await;
    assert!(all.is_some(), "handled {}", handled.load(Ordering::SeqCst));

    subscriber.stop().await.unwrap();
    subscriber.stop().await.unwrap();
    assert_eq!(subscriber.running_workers(), 0);

    let channel = raw_channel(&connection).await;
    let leftover = channel
        .basic_get(&queue, BasicGetOptions { no_ack: true })
        .await
        .unwrap();
    assert!(leftover.is_none(), "every message should have been acked");

    cleanup(&channel, &[&queue], &[]).await;
    publisher.close().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_failing_message_is_retried_then_dead_lettered() {
    let shutdown = Shutdown::new();
    let connection = connect(&shutdown).await;
    let queue = unique_queue("relay-fail");

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let opts = SubscribeOptions::new(&queue, false)
        .with_workers(1, 1)
        .with_retry_policy(
            RetryStrategy::Fixed,
            Duration::from_millis(100),
            Duration::from_secs(1),
            2,
        );
    let dead_letter = opts.dead_letter_name.clone();

    let subscriber = Subscriber::new(
        connection.clone(),
        handler_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("always fails"))
        }),
        opts,
        &shutdown,
    );
    subscriber.start().unwrap();

    let publisher = Publisher::new(connection.clone(), &shutdown);
    let message = Message::new("poison", None).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    publisher.publish(&queue, &message).await.unwrap();

    let channel = raw_channel(&connection).await;
    let (inspect, dead_letter_queue) = (&channel, dead_letter.as_str());
    let dead = eventually(Duration::from_secs(15), || async move {
        inspect
            .basic_get(dead_letter_queue, BasicGetOptions { no_ack: true })
            .await
            .ok()
            .flatten()
    })
    .await
    .expect("message should reach the dead letter queue");

    // First delivery plus two retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(dead.delivery.data, b"poison");

    let headers = dead.delivery.properties.headers().clone().unwrap_or_default();
    let headers = headers.inner();
    assert!(matches!(
        headers.get(&ShortString::from(RETRY_COUNT_HEADER)),
        Some(AMQPValue::LongLongInt(2))
    ));
    assert!(matches!(
        headers.get(&ShortString::from(DEATH_QUEUE_HEADER)),
        Some(AMQPValue::LongString(q)) if q.as_bytes() == queue.as_bytes()
    ));
    assert_eq!(
        dead.delivery.properties.message_id().as_ref().map(|id| id.as_str()),
        Some(message.id())
    );

    subscriber.stop().await.unwrap();
    cleanup(&channel, &[&queue, &dead_letter], &[&dead_letter]).await;
    publisher.close().await.unwrap();
    connection.close().await.unwrap();
}
