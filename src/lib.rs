//! AMQP client for services that publish work, serve RPC calls, and consume queues
//! with retries and dead-lettering.
//!
//! A [`ConnectionManager`] keeps one broker connection alive and redials after loss.
//! [`Publisher`] and [`Subscriber`] sit on top of it, each holding their own
//! channels through a [`ChannelManager`](rabbitmq::ChannelManager). Everything
//! long-lived hangs off a [`Shutdown`] token.

pub mod config;
pub mod env;
pub mod rabbitmq;
pub mod shutdown;

pub use rabbitmq::{
    handler_fn, json_handler, ConnectionConfig, ConnectionManager, Message, MessageHandler,
    Payload, PendingReply, Publisher, RabbitMQError, Result, RetryStrategy, RpcResponse,
    SubscribeOptions, Subscriber,
};
pub use shutdown::Shutdown;
