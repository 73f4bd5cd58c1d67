use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::rabbitmq::{ConnectionConfig, SubscribeOptions};

const DEFAULT_QUEUE: &str = "amqp-relay";

fn default_connect_timeout_seconds() -> u64 {
    10
}

/// Settings read from the process environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub queue: String,
    pub worker_count: Option<usize>,
    pub prefetch_count: Option<u16>,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `load` passes the process environment.
    ///
    /// `RABBITMQ_URI` (or `AMQP_ADDR`) wins over the individual `RABBIT_*` parts.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ConnectionConfig::default();
        let uri = lookup("RABBITMQ_URI")
            .or_else(|| lookup("AMQP_ADDR"))
            .filter(|uri| !uri.is_empty());

        let connection = ConnectionConfig {
            uri,
            username: lookup("RABBIT_USER").unwrap_or(defaults.username),
            password: lookup("RABBIT_PASS").unwrap_or(defaults.password),
            host: lookup("RABBIT_HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "RABBIT_PORT")?.unwrap_or(defaults.port),
            connect_timeout: Duration::from_secs(
                parse(&lookup, "RABBITMQ_CONNECT_TIMEOUT_SECONDS")?
                    .unwrap_or_else(default_connect_timeout_seconds),
            ),
            ..defaults
        };

        Ok(Config {
            connection,
            queue: lookup("RELAY_QUEUE").unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            worker_count: parse(&lookup, "RELAY_WORKER_COUNT")?,
            prefetch_count: parse(&lookup, "RELAY_PREFETCH_COUNT")?,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connection.connect_timeout
    }

    /// Options for the configured queue, with any worker overrides applied.
    pub fn subscribe_options(&self, is_rpc: bool) -> SubscribeOptions {
        let mut opts = SubscribeOptions::new(&self.queue, is_rpc);
        if let Some(workers) = self.worker_count {
            opts.worker_count = workers;
        }
        if let Some(prefetch) = self.prefetch_count {
            opts.prefetch_count = prefetch;
        }
        opts
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(None),
    }
}
