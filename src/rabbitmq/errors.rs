// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("Operation cancelled: the owning shutdown signal has fired")]
    Cancelled,

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Channel is not available: {0}")]
    ChannelNotAvailable(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Timed out after {0:?} waiting for workers to stop")]
    ShutdownTimeout(Duration),

    #[error("Subscriber is already running")]
    AlreadyRunning,

    #[error("Response channel was closed before a reply arrived")]
    ResponseChannelClosed,

    #[error("A call with correlation id {0} is already pending")]
    DuplicateCorrelationId(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    pub(crate) fn channel(context: &str, error: lapin::Error) -> Self {
        RabbitMQError::ChannelError(format!("{}: {}", context, error))
    }

    pub(crate) fn publish(context: &str, error: lapin::Error) -> Self {
        RabbitMQError::PublishError(format!("{}: {}", context, error))
    }

    pub(crate) fn ack(context: &str, error: lapin::Error) -> Self {
        RabbitMQError::AckError(format!("{}: {}", context, error))
    }
}
