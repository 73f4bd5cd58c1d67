use futures_lite::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicConsumeOptions, BasicPublishOptions},
    types::FieldTable,
    Channel, Consumer,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel_manager::{ChannelConfig, ChannelManager};
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::message::{Envelope, Message, RpcResponse};
use crate::shutdown::Shutdown;

/// RabbitMQ's pseudo-queue for replies routed straight back to the consuming channel.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

struct Waiter {
    epoch: u64,
    sender: oneshot::Sender<RpcResponse>,
}

/// Outstanding calls keyed by correlation id.
#[derive(Clone, Default)]
struct Replies {
    waiters: Arc<Mutex<HashMap<String, Waiter>>>,
}

impl Replies {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, correlation_id: &str, epoch: u64) -> Result<PendingReply> {
        let mut waiters = self.lock();
        if waiters.contains_key(correlation_id) {
            return Err(RabbitMQError::DuplicateCorrelationId(correlation_id.to_string()));
        }

        let (sender, receiver) = oneshot::channel();
        waiters.insert(correlation_id.to_string(), Waiter { epoch, sender });

        Ok(PendingReply {
            correlation_id: correlation_id.to_string(),
            receiver,
            waiters: Arc::downgrade(&self.waiters),
        })
    }

    fn forget(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    /// Hand `response` to its caller. Returns false for unknown (late or duplicate) ids.
    fn resolve(&self, correlation_id: &str, response: RpcResponse) -> bool {
        let waiter = self.lock().remove(correlation_id);
        match waiter {
            // A caller that already gave up has dropped its receiver; nothing to do.
            Some(waiter) => {
                let _ = waiter.sender.send(response);
                true
            }
            None => false,
        }
    }

    /// Drop every call that was waiting on listener `epoch`.
    fn fail_epoch(&self, epoch: u64) -> usize {
        let mut waiters = self.lock();
        let before = waiters.len();
        waiters.retain(|_, waiter| waiter.epoch != epoch);
        before - waiters.len()
    }

    fn fail_all(&self) -> usize {
        let mut waiters = self.lock();
        let failed = waiters.len();
        waiters.clear();
        failed
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// The reply to one [`Publisher::call`].
///
/// Resolves with the caller's [`RpcResponse`], or with
/// [`RabbitMQError::ResponseChannelClosed`] when the reply listener or the publisher
/// goes away first. There is no built-in timeout: wrap it in `tokio::time::timeout`.
/// Dropping it withdraws the call, and a reply arriving afterwards is discarded.
pub struct PendingReply {
    correlation_id: String,
    receiver: oneshot::Receiver<RpcResponse>,
    waiters: Weak<Mutex<HashMap<String, Waiter>>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for PendingReply {
    type Output = Result<RpcResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.map_err(|_| RabbitMQError::ResponseChannelClosed))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(waiters) = self.waiters.upgrade() {
            waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.correlation_id);
        }
    }
}

struct ReplyListener {
    channel: Channel,
    epoch: u64,
    alive: Arc<AtomicBool>,
}

/// Sends persistent messages and RPC calls.
///
/// Plain publishes go out on a confirm-mode channel and only succeed once the broker
/// has acknowledged them. Calls use direct reply-to: a listener consumes
/// [`DIRECT_REPLY_TO`] on a second channel and every call is published on that same
/// channel, as the broker requires.
pub struct Publisher {
    channel: ChannelManager,
    reply_channel: ChannelManager,
    listener: AsyncMutex<Option<ReplyListener>>,
    replies: Replies,
    epoch: AtomicU64,
    shutdown: Shutdown,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>, parent: &Shutdown) -> Self {
        Self {
            channel: ChannelManager::new(
                connection.clone(),
                ChannelConfig::with_id("publisher").with_confirms(),
            ),
            reply_channel: ChannelManager::new(
                connection,
                ChannelConfig::with_id("publisher-replies").with_confirms(),
            ),
            listener: AsyncMutex::new(None),
            replies: Replies::default(),
            epoch: AtomicU64::new(0),
            shutdown: parent.child(),
        }
    }

    /// Publish `message` to `queue` through the default exchange. Not retried.
    pub async fn publish(&self, queue: &str, message: &Message) -> Result<()> {
        self.publish_to("", queue, message).await
    }

    pub async fn publish_to(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        let channel = self.channel.get_channel().await?;
        send(&channel, exchange, routing_key, message.generate_payload()).await?;

        info!(
            message_id = %message.id(),
            exchange,
            routing_key,
            "Published message"
        );
        Ok(())
    }

    /// Publish an RPC envelope whose reply goes to a destination of the caller's
    /// choosing. Returns the correlation id.
    pub async fn send_rpc(
        &self,
        queue: &str,
        message: &Message,
        pattern: &str,
        reply_to: &str,
    ) -> Result<String> {
        let envelope = message.generate_rpc_payload(reply_to, pattern)?;
        let channel = self.channel.get_channel().await?;
        send(&channel, "", queue, envelope).await?;

        debug!(correlation_id = %message.id(), queue, pattern, reply_to, "Sent RPC request");
        Ok(message.id().to_string())
    }

    /// Call `pattern` on the subscriber behind `queue`.
    ///
    /// The waiter is registered before the request is published, so a fast reply
    /// cannot be missed.
    pub async fn call(&self, queue: &str, message: &Message, pattern: &str) -> Result<PendingReply> {
        if self.shutdown.is_cancelled() {
            return Err(RabbitMQError::Cancelled);
        }

        let envelope = message.generate_rpc_payload(DIRECT_REPLY_TO, pattern)?;
        let (channel, epoch) = self.reply_listener().await?;
        let pending = self.replies.register(message.id(), epoch)?;

        if let Err(err) = send(&channel, "", queue, envelope).await {
            self.replies.forget(message.id());
            return Err(err);
        }

        debug!(correlation_id = %message.id(), queue, pattern, "Sent RPC call");
        Ok(pending)
    }

    /// Channel the current reply listener consumes on, starting a listener if needed.
    async fn reply_listener(&self) -> Result<(Channel, u64)> {
        let mut listener = self.listener.lock().await;
        if let Some(active) = listener.as_ref() {
            if active.alive.load(Ordering::SeqCst) && active.channel.status().connected() {
                return Ok((active.channel.clone(), active.epoch));
            }
        }

        let channel = self.reply_channel.get_channel().await?;
        let consumer = channel
            .basic_consume(
                DIRECT_REPLY_TO,
                &format!("replies-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(format!("failed to consume replies: {}", e)))?;

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let alive = Arc::new(AtomicBool::new(true));
        tokio::spawn(listen(
            consumer,
            epoch,
            self.replies.clone(),
            alive.clone(),
            self.shutdown.clone(),
        ));
        info!(epoch, "Reply listener started");

        *listener = Some(ReplyListener {
            channel: channel.clone(),
            epoch,
            alive,
        });
        Ok((channel, epoch))
    }

    /// Calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.replies.len()
    }

    /// Stop the reply listener, fail outstanding calls, release both channels.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.listener.lock().await.take();

        let failed = self.replies.fail_all();
        if failed > 0 {
            warn!(failed, "Publisher closed with calls still waiting for a reply");
        }

        self.reply_channel.close().await?;
        self.channel.close().await
    }
}

async fn send(channel: &Channel, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<()> {
    let confirmation = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            &envelope.body,
            envelope.properties,
        )
        .await
        .map_err(|e| RabbitMQError::publish("failed to publish message", e))?
        .await
        .map_err(|e| RabbitMQError::publish("failed to confirm publish", e))?;

    if confirmation.is_nack() {
        return Err(RabbitMQError::PublishError(format!(
            "broker rejected message for {}/{}",
            exchange, routing_key
        )));
    }
    Ok(())
}

async fn listen(
    mut consumer: Consumer,
    epoch: u64,
    replies: Replies,
    alive: Arc<AtomicBool>,
    shutdown: Shutdown,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = consumer.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    error!(epoch, error = %err, "Reply listener failed");
                    break;
                }
                None => break,
            },
        };
        dispatch_reply(&replies, delivery);
    }

    alive.store(false, Ordering::SeqCst);
    let failed = replies.fail_epoch(epoch);
    info!(epoch, failed, "Reply listener stopped");
}

fn dispatch_reply(replies: &Replies, delivery: Delivery) {
    let Some(correlation_id) = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|id| id.to_string())
    else {
        warn!("Discarding reply without a correlation id");
        return;
    };

    let response = serde_json::from_slice::<RpcResponse>(&delivery.data).unwrap_or_else(|err| {
        RpcResponse {
            id: correlation_id.clone(),
            ..RpcResponse::failure(format!("malformed reply: {}", err))
        }
    });

    if !replies.resolve(&correlation_id, response) {
        warn!(%correlation_id, "Discarding reply with no pending call (late or duplicate)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::connection::ConnectionConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_reply_resolves_waiter_once() {
        let replies = Replies::default();
        let pending = replies.register("msg_a_1", 1).unwrap();
        assert_eq!(pending.correlation_id(), "msg_a_1");

        assert!(replies.resolve("msg_a_1", RpcResponse::success(json!({"ok": true}))));
        assert!(!replies.resolve("msg_a_1", RpcResponse::success(json!({"ok": false}))));

        let response = pending.await.unwrap();
        assert_eq!(response.response, Some(json!({"ok": true})));
        assert_eq!(replies.len(), 0);
    }

    #[test]
    fn test_new_outside_runtime() {
        let parent = Shutdown::new();
        let connection = ConnectionManager::new(&ConnectionConfig::default(), &parent);
        let publisher = Publisher::new(connection, &parent);
        assert_eq!(publisher.pending_calls(), 0);

        parent.cancel();
        assert!(publisher.shutdown.is_cancelled());
    }

    #[test]
    fn test_duplicate_correlation_id_is_refused() {
        let replies = Replies::default();
        let _first = replies.register("msg_a_1", 1).unwrap();
        assert!(matches!(
            replies.register("msg_a_1", 1),
            Err(RabbitMQError::DuplicateCorrelationId(id)) if id == "msg_a_1"
        ));
    }

    #[test]
    fn test_dropping_pending_reply_withdraws_call() {
        let replies = Replies::default();
        let pending = replies.register("msg_a_1", 1).unwrap();
        assert_eq!(replies.len(), 1);
        drop(pending);
        assert_eq!(replies.len(), 0);
        assert!(!replies.resolve("msg_a_1", RpcResponse::default()));
    }

    #[tokio::test]
    async fn test_listener_loss_fails_only_its_calls() {
        let replies = Replies::default();
        let old = replies.register("msg_old_1", 1).unwrap();
        let current = replies.register("msg_new_1", 2).unwrap();

        assert_eq!(replies.fail_epoch(1), 1);
        assert!(matches!(old.await, Err(RabbitMQError::ResponseChannelClosed)));

        assert!(replies.resolve("msg_new_1", RpcResponse::failure("nope")));
        let response = current.await.unwrap();
        assert_eq!(response.into_result(), Err("nope".to_string()));
    }

    #[tokio::test]
    async fn test_call_without_connection_fails() {
        let connection = ConnectionManager::new(&ConnectionConfig::default(), &Shutdown::new());
        let publisher = Publisher::new(connection, &Shutdown::new());
        let message = Message::new("hi", None).unwrap();

        assert!(matches!(
            publisher.publish("q", &message).await,
            Err(RabbitMQError::ChannelNotAvailable(_))
        ));
        assert!(matches!(
            publisher.call("q", &message, "echo").await,
            Err(RabbitMQError::ChannelNotAvailable(_))
        ));
        assert_eq!(publisher.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_call_after_close_is_cancelled() {
        let connection = ConnectionManager::new(&ConnectionConfig::default(), &Shutdown::new());
        let publisher = Publisher::new(connection, &Shutdown::new());
        publisher.close().await.unwrap();

        let message = Message::new("hi", None).unwrap();
        assert!(matches!(
            publisher.call("q", &message, "echo").await,
            Err(RabbitMQError::Cancelled)
        ));
    }
}
