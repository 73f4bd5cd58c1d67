// src/rabbitmq/mod.rs
// Resilient RabbitMQ client: connection supervision, channels, publishing, subscribing

pub mod errors;
pub mod connection;
pub mod channel_manager;
pub mod message;
pub mod options;
pub mod retry;
pub mod outcome;
pub mod handler;

mod publisher;
mod subscriber;

// Re-export specific items to simplify imports elsewhere
pub use channel_manager::{ChannelConfig, ChannelManager};
pub use connection::{ConnectionConfig, ConnectionManager};
pub use errors::{RabbitMQError, Result};
pub use handler::{handler_fn, json_handler, MessageHandler};
pub use message::{Envelope, Message, Payload, RpcBody, RpcResponse};
pub use options::{QueueConfig, RetryStrategy, SubscribeOptions};
pub use publisher::{PendingReply, Publisher, DIRECT_REPLY_TO};
pub use subscriber::Subscriber;
