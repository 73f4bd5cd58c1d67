use lapin::{
    options::{BasicConsumeOptions, QueueDeclareOptions},
    types::FieldTable,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::retry;

/// Prefix of the dead-letter exchange and queue for a subscribed queue.
pub const DEAD_LETTER_PREFIX: &str = "fail:";

/// Queue declaration flags.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
            arguments: FieldTable::default(),
        }
    }
}

impl QueueConfig {
    pub fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: self.durable,
            auto_delete: self.auto_delete,
            exclusive: self.exclusive,
            nowait: self.no_wait,
            ..QueueDeclareOptions::default()
        }
    }
}

/// How long to wait before the n-th retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RetryStrategy {
    /// Always the base delay
    #[default]
    Fixed,
    /// base × n
    Linear,
    /// base × 2ⁿ
    Exponential,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Fixed => "fixed",
            RetryStrategy::Linear => "linear",
            RetryStrategy::Exponential => "exponential",
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized names fall back to exponential.
impl From<&str> for RetryStrategy {
    fn from(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "fixed" => RetryStrategy::Fixed,
            "linear" => RetryStrategy::Linear,
            _ => RetryStrategy::Exponential,
        }
    }
}

impl From<String> for RetryStrategy {
    fn from(name: String) -> Self {
        RetryStrategy::from(name.as_str())
    }
}

impl From<RetryStrategy> for String {
    fn from(strategy: RetryStrategy) -> Self {
        strategy.as_str().to_string()
    }
}

impl FromStr for RetryStrategy {
    type Err = std::convert::Infallible;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Ok(RetryStrategy::from(name))
    }
}

/// Everything a [`Subscriber`](super::Subscriber) needs to know about its queue.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Declaration flags; `None` uses [`QueueConfig::default`]
    pub queue_opts: Option<QueueConfig>,
    pub queue_name: String,
    pub consumer_name: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
    pub args: FieldTable,
    pub worker_count: usize,
    /// Unacknowledged deliveries per worker, and the size of its processing pool
    pub prefetch_count: u16,
    pub is_rpc: bool,
    pub max_retry_attempts: u32,
    pub enable_dead_letter: bool,
    pub dead_letter_name: String,
    pub retry_strategy: RetryStrategy,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Hard deadline for one handler invocation, kept under the broker's
    /// 30 minute consumer timeout
    pub processing_timeout: Duration,
    /// How long `stop` waits for in-flight work
    pub shutdown_timeout: Duration,
}

impl SubscribeOptions {
    pub fn new(queue_name: &str, is_rpc: bool) -> Self {
        let mut opts = SubscribeOptions {
            queue_opts: None,
            queue_name: queue_name.to_string(),
            consumer_name: queue_name.to_string(),
            auto_ack: false,
            exclusive: false,
            no_local: false,
            no_wait: false,
            args: FieldTable::default(),
            worker_count: 3,
            prefetch_count: 10,
            is_rpc,
            max_retry_attempts: 5,
            enable_dead_letter: true,
            dead_letter_name: format!("{}{}", DEAD_LETTER_PREFIX, queue_name),
            retry_strategy: RetryStrategy::Fixed,
            base_retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(10 * 60),
            processing_timeout: Duration::from_secs(25 * 60),
            shutdown_timeout: Duration::from_secs(60),
        };

        if is_rpc {
            opts.worker_count = 5;
            opts.prefetch_count = 1;
        }

        opts
    }

    pub fn with_workers(mut self, worker_count: usize, prefetch_count: u16) -> Self {
        self.worker_count = worker_count;
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_retry_policy(
        mut self,
        strategy: RetryStrategy,
        base_delay: Duration,
        max_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        self.retry_strategy = strategy;
        self.base_retry_delay = base_delay;
        self.max_retry_delay = max_delay;
        self.max_retry_attempts = max_attempts;
        self
    }

    pub fn without_dead_letter(mut self) -> Self {
        self.enable_dead_letter = false;
        self
    }

    /// Delay before publishing retry number `retry_count`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        retry::retry_delay(
            self.retry_strategy,
            self.base_retry_delay,
            self.max_retry_delay,
            retry_count,
        )
    }

    pub fn consume_options(&self) -> BasicConsumeOptions {
        BasicConsumeOptions {
            no_local: self.no_local,
            no_ack: self.auto_ack,
            exclusive: self.exclusive,
            nowait: self.no_wait,
        }
    }

    /// Size of the per-worker processing pool. Never zero.
    pub(crate) fn pool_size(&self) -> usize {
        usize::from(self.prefetch_count).max(1)
    }
}
