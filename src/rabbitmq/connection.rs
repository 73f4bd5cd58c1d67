use lapin::{Connection, ConnectionProperties, Error as LapinError};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::errors::{RabbitMQError, Result};
use crate::shutdown::Shutdown;

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to reach the broker.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Full AMQP URI. Takes precedence over the individual parts when set.
    pub uri: Option<String>,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    /// Fixed pause between reconnect attempts
    pub retry_interval: Duration,
    /// Upper bound for a single dial
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: None,
            username: "guest".to_string(),
            password: "guest".to_string(),
            host: "localhost".to_string(),
            port: 5672,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Self::default()
        }
    }

    pub fn url(&self) -> String {
        match &self.uri {
            Some(uri) if !uri.is_empty() => uri.clone(),
            _ => format!(
                "amqp://{}:{}@{}:{}/",
                self.username, self.password, self.host, self.port
            ),
        }
    }
}

struct ConnectionState {
    connection: Option<Arc<Connection>>,
    connected: bool,
    generation: u64,
}

/// Owns the single broker connection and keeps it alive.
///
/// After every successful dial a monitor task listens for the connection's error
/// notification; on loss it marks the manager disconnected and redials every
/// `retry_interval` until it succeeds or the manager's shutdown fires.
pub struct ConnectionManager {
    url: String,
    retry_interval: Duration,
    connect_timeout: Duration,
    state: Mutex<ConnectionState>,
    shutdown: Shutdown,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Build an unconnected manager whose lifetime is bounded by `parent`.
    pub fn new(config: &ConnectionConfig, parent: &Shutdown) -> Arc<Self> {
        Arc::new_cyclic(|this| ConnectionManager {
            url: config.url(),
            retry_interval: config.retry_interval,
            connect_timeout: config.connect_timeout,
            state: Mutex::new(ConnectionState {
                connection: None,
                connected: false,
                generation: 0,
            }),
            shutdown: parent.child(),
            this: this.clone(),
        })
    }

    /// Build a manager and dial immediately. A failed initial dial is fatal.
    pub async fn open(config: &ConnectionConfig, parent: &Shutdown) -> Result<Arc<Self>> {
        let manager = Self::new(config, parent);
        if let Err(err) = manager.connect().await {
            manager.shutdown.cancel();
            return Err(err);
        }
        Ok(manager)
    }

    /// Dial the broker. No-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.connected {
            return Ok(());
        }

        if self.shutdown.is_cancelled() {
            return Err(RabbitMQError::Cancelled);
        }

        info!(url = %redacted(&self.url), "Attempting to connect to RabbitMQ");
        let connection = timeout(
            self.connect_timeout,
            Connection::connect(&self.url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| {
            RabbitMQError::ConnectionError(format!(
                "connection to RabbitMQ timed out after {:?}",
                self.connect_timeout
            ))
        })?
        .map_err(|e| RabbitMQError::ConnectionError(format!("failed to connect to RabbitMQ: {}", e)))?;

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = errors_tx.send(err);
        });

        state.connection = Some(Arc::new(connection));
        state.connected = true;
        state.generation += 1;
        let generation = state.generation;
        drop(state);

        info!(generation, "Successfully connected to RabbitMQ");
        self.spawn_monitor(errors_rx, generation);
        Ok(())
    }

    fn spawn_monitor(&self, mut errors: mpsc::UnboundedReceiver<LapinError>, generation: u64) {
        let manager = self.this.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let err = tokio::select! {
                received = errors.recv() => match received {
                    Some(err) => err,
                    None => return,
                },
                _ = shutdown.cancelled() => return,
            };

            if let Some(manager) = manager.upgrade() {
                manager.reconnect(err, generation).await;
            }
        });
    }

    async fn reconnect(&self, err: LapinError, generation: u64) {
        {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                debug!(generation, "Stale connection monitor exiting");
                return;
            }
            state.connected = false;
        }
        warn!(error = %err, "Connection lost. Attempting to reconnect...");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = sleep(self.retry_interval) => {}
            }

            match self.connect().await {
                Ok(()) => {
                    info!("Reconnected successfully");
                    return;
                }
                Err(RabbitMQError::Cancelled) => return,
                Err(err) => warn!(
                    error = %err,
                    retry_in = ?self.retry_interval,
                    "Failed to reconnect"
                ),
            }
        }
    }

    /// The current connection handle, or `None` once closed or before the first dial.
    ///
    /// The handle may belong to a connection that has just died; callers find out
    /// when channel creation fails.
    pub async fn get_connection(&self) -> Option<Arc<Connection>> {
        let state = self.state.lock().await;
        if self.shutdown.is_cancelled() {
            return None;
        }
        state.connection.clone()
    }

    /// Cancel supervision and close the connection. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();

        let mut state = self.state.lock().await;
        state.connected = false;
        if let Some(connection) = state.connection.take() {
            info!("Closing RabbitMQ connection gracefully");
            if connection.status().connected() {
                connection.close(200, "Closing connection").await.map_err(|e| {
                    RabbitMQError::ConnectionError(format!("failed to close connection: {}", e))
                })?;
            }
        }
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        let state = self.state.lock().await;
        self.shutdown.is_cancelled() || !state.connected
    }

    /// Number of successful dials so far.
    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }
}

fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
