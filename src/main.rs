use amqp_relay::config;
use amqp_relay::env::Config;
use amqp_relay::rabbitmq::{RpcBody, RpcResponse};
use amqp_relay::{handler_fn, ConnectionManager, Message, Publisher, Shutdown, Subscriber};
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let env = Config::load().context("Failed to load environment configuration")?;
    let file = match config::load_config() {
        Ok(file) => Some(file),
        Err(err) => {
            debug!("No configuration file used: {:#}", err);
            None
        }
    };

    let connection_config = file
        .as_ref()
        .map(|file| file.connection_config())
        .unwrap_or_else(|| env.connection.clone());

    let mode = std::env::args().nth(1).unwrap_or_else(|| "worker".to_string());
    let shutdown = Shutdown::new();
    let connection = ConnectionManager::open(&connection_config, &shutdown).await?;

    let result = match mode.as_str() {
        "worker" => {
            let mut opts = env.subscribe_options(true);
            if let Some(file) = &file {
                opts = file.apply(opts);
            }
            run_echo_worker(connection.clone(), opts, &shutdown).await
        }
        "publish" => publish_sample(connection.clone(), &env.queue, &shutdown).await,
        "call" => call_sample(connection.clone(), &env.queue, &shutdown).await,
        other => Err(anyhow::anyhow!(
            "unknown mode {:?}; expected worker, publish or call",
            other
        )),
    };

    shutdown.cancel();
    connection.close().await?;
    result
}

/// Serve the queue until Ctrl-C, answering every call with what it was sent.
async fn run_echo_worker(
    connection: Arc<ConnectionManager>,
    opts: amqp_relay::SubscribeOptions,
    shutdown: &Shutdown,
) -> Result<()> {
    let handler = handler_fn(|body, properties| {
        info!(
            message_id = ?properties.message_id(),
            bytes = body.len(),
            "Received message"
        );
        Ok(echo(body))
    });

    let subscriber = Subscriber::new(connection, handler, opts, shutdown);
    subscriber.start()?;
    info!("Worker running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");

    subscriber.stop().await?;
    Ok(())
}

fn echo(body: &[u8]) -> Value {
    if let Ok(call) = serde_json::from_slice::<RpcBody>(body) {
        return call.data;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

async fn publish_sample(connection: Arc<ConnectionManager>, queue: &str, shutdown: &Shutdown) -> Result<()> {
    let publisher = Publisher::new(connection, shutdown);
    let message = Message::new(json!({"greeting": "hello", "from": "amqp-relay"}), None)?;
    publisher.publish(queue, &message).await?;
    info!(message_id = %message.id(), queue, "Sample message published");
    publisher.close().await?;
    Ok(())
}

async fn call_sample(connection: Arc<ConnectionManager>, queue: &str, shutdown: &Shutdown) -> Result<()> {
    let publisher = Publisher::new(connection, shutdown);
    let message = Message::new(json!({"x": 1}), None)?;

    let pending = publisher.call(queue, &message, "echo").await?;
    let reply = tokio::time::timeout(CALL_TIMEOUT, pending)
        .await
        .with_context(|| format!("No reply within {:?}", CALL_TIMEOUT))??;
    publisher.close().await?;

    print_reply(reply)
}

fn print_reply(reply: RpcResponse) -> Result<()> {
    match reply.into_result() {
        Ok(response) => {
            println!("{}", response.unwrap_or(Value::Null));
            Ok(())
        }
        Err(err) => bail!("remote handler failed: {}", err),
    }
}
