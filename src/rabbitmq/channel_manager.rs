use lapin::{
    options::{BasicQosOptions, ConfirmSelectOptions},
    Channel, Connection,
};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 leaves the broker default)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging (defaults to a UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 0,
            confirm_mode: false,
            id: format!("channel-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

impl ChannelConfig {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_confirms(mut self) -> Self {
        self.confirm_mode = true;
        self
    }
}

struct ActiveChannel {
    channel: Channel,
    /// The connection the channel was opened on
    origin: Weak<Connection>,
}

/// Owns one channel on whatever connection the [`ConnectionManager`] currently holds.
///
/// The connection is re-resolved on every [`get_channel`](Self::get_channel) call, so a
/// channel opened on a connection that has since been replaced is never handed out.
pub struct ChannelManager {
    connection: Arc<ConnectionManager>,
    channel: Mutex<Option<ActiveChannel>>,
    config: ChannelConfig,
}

impl ChannelManager {
    pub fn new(connection: Arc<ConnectionManager>, config: ChannelConfig) -> Self {
        debug!(
            channel_id = %config.id,
            prefetch = %config.prefetch_count,
            confirm = %config.confirm_mode,
            "Creating channel manager"
        );

        Self {
            connection,
            channel: Mutex::new(None),
            config,
        }
    }

    /// Get a channel, creating one if needed
    /// Returns a cloned Channel that can be used independently
    pub async fn get_channel(&self) -> Result<Channel> {
        let connection = self.connection.get_connection().await.ok_or_else(|| {
            RabbitMQError::ChannelNotAvailable("no live connection".to_string())
        })?;

        let mut guard = self.channel.lock().await;

        if let Some(active) = guard.as_ref() {
            let same_connection = active.origin.as_ptr() == Arc::as_ptr(&connection);
            if same_connection && active.channel.status().connected() {
                return Ok(active.channel.clone());
            }
            debug!(
                channel_id = %self.config.id,
                same_connection,
                "Held channel is stale, opening a new one"
            );
        }

        let channel = self.create_channel(&connection).await?;
        *guard = Some(ActiveChannel {
            channel: channel.clone(),
            origin: Arc::downgrade(&connection),
        });
        Ok(channel)
    }

    async fn create_channel(&self, connection: &Connection) -> Result<Channel> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::channel("failed to create channel", e))?;

        if self.config.prefetch_count > 0 {
            debug!("Setting channel QoS to {}", self.config.prefetch_count);
            channel
                .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| RabbitMQError::channel("failed to set QoS", e))?;
        }

        if self.config.confirm_mode {
            debug!("Enabling confirm mode for channel {}", self.config.id);
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| RabbitMQError::channel("failed to enable confirm mode", e))?;
        }

        info!("Channel {} created and configured successfully", self.config.id);
        Ok(channel)
    }

    /// Release the held channel. The next `get_channel` opens a fresh one.
    pub async fn close(&self) -> Result<()> {
        let active = self.channel.lock().await.take();
        if let Some(active) = active {
            if active.channel.status().connected() {
                active
                    .channel
                    .close(200, "Closing channel")
                    .await
                    .map_err(|e| RabbitMQError::channel("failed to close channel", e))?;
            }
            debug!(channel_id = %self.config.id, "Channel released");
        }
        Ok(())
    }

    /// Check if the channel is in a healthy state
    pub async fn is_healthy(&self) -> bool {
        match self.channel.lock().await.as_ref() {
            Some(active) => active.origin.strong_count() > 0 && active.channel.status().connected(),
            None => false,
        }
    }

    /// Return the channel ID for logging
    pub fn id(&self) -> &str {
        &self.config.id
    }
}
