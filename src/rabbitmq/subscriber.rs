use chrono::Utc;
use futures_lite::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicRejectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::channel_manager::{ChannelConfig, ChannelManager};
use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::handler::{run_handler, MessageHandler};
use super::options::SubscribeOptions;
use super::outcome::{settle, HandlerOutcome, RpcReply, Settlement};
use super::retry::ConsumeBackoff;
use crate::shutdown::Shutdown;

/// Keeps a run's drain channel open for as long as any clone is alive.
#[derive(Clone)]
struct Tracker {
    _sender: mpsc::Sender<()>,
}

struct RunState {
    shutdown: Shutdown,
    tracker: Tracker,
    drained: mpsc::Receiver<()>,
}

struct Inner {
    opts: SubscribeOptions,
    handler: Arc<dyn MessageHandler>,
    channels: Vec<ChannelManager>,
    parent: Shutdown,
    running: AtomicBool,
    generation: AtomicU64,
    active_workers: AtomicUsize,
    in_flight: AtomicUsize,
    run: Mutex<Option<RunState>>,
    dead_letter_ready: OnceCell<()>,
}

/// A pool of workers consuming one queue.
///
/// Each worker owns a channel and feeds deliveries into a processing pool of
/// `prefetch_count` slots; a full pool stops the worker from pulling more, so
/// nothing is buffered beyond what the broker has already sent. Finished
/// deliveries are settled according to [`settle`]: acked, retried after a delay,
/// dead-lettered, rejected, or answered when they are RPC calls.
///
/// Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<Inner>,
}

impl Subscriber {
    pub fn new<H: MessageHandler>(
        connection: Arc<ConnectionManager>,
        handler: H,
        opts: SubscribeOptions,
        parent: &Shutdown,
    ) -> Self {
        let channels = (0..opts.worker_count)
            .map(|worker_id| {
                ChannelManager::new(
                    connection.clone(),
                    ChannelConfig {
                        prefetch_count: opts.prefetch_count,
                        ..ChannelConfig::with_id(format!("{}-worker-{}", opts.consumer_name, worker_id))
                    },
                )
            })
            .collect();

        Self {
            inner: Arc::new(Inner {
                opts,
                handler: Arc::new(handler),
                channels,
                parent: parent.clone(),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                active_workers: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                run: Mutex::new(None),
                dead_letter_ready: OnceCell::new(),
            }),
        }
    }

    /// Spawn the workers. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut run = inner.lock_run();
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(RabbitMQError::AlreadyRunning);
        }
        if inner.parent.is_cancelled() {
            inner.running.store(false, Ordering::SeqCst);
            return Err(RabbitMQError::Cancelled);
        }

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shutdown = inner.parent.child();
        let (sender, drained) = mpsc::channel(1);
        let tracker = Tracker { _sender: sender };

        for worker_id in 0..inner.opts.worker_count {
            tokio::spawn(run_worker(
                inner.clone(),
                worker_id,
                shutdown.clone(),
                tracker.clone(),
            ));
        }

        let subscriber = self.clone();
        let parent = inner.parent.clone();
        let run_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = parent.cancelled() => {
                    info!("Parent shutdown fired, stopping subscriber");
                    if let Err(err) = subscriber.stop().await {
                        error!(error = %err, "Subscriber did not stop cleanly");
                    }
                }
                _ = run_shutdown.cancelled() => {}
            }
        });

        *run = Some(RunState {
            shutdown,
            tracker,
            drained,
        });

        info!(
            queue = %inner.opts.queue_name,
            workers = inner.opts.worker_count,
            prefetch = inner.opts.prefetch_count,
            generation,
            "Subscriber started"
        );
        Ok(())
    }

    /// Stop all workers and wait for in-flight work, up to the configured stop
    /// timeout. A second call is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let run = {
            let mut run = inner.lock_run();
            if !inner.running.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            run.take()
        };
        let Some(RunState {
            shutdown,
            tracker,
            mut drained,
        }) = run
        else {
            return Ok(());
        };

        info!(queue = %inner.opts.queue_name, "Stopping subscriber");
        shutdown.cancel();
        drop(tracker);

        let wait = inner.opts.shutdown_timeout;
        let finished = timeout(wait, drained.recv()).await.is_ok();

        for channel in &inner.channels {
            if let Err(err) = channel.close().await {
                warn!(channel_id = %channel.id(), error = %err, "Error closing worker channel");
            }
        }

        if !finished {
            error!(?wait, "Timed out waiting for workers to stop");
            return Err(RabbitMQError::ShutdownTimeout(wait));
        }

        info!(queue = %inner.opts.queue_name, "Subscriber stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Workers currently inside their consume loop.
    pub fn running_workers(&self) -> usize {
        self.inner.active_workers.load(Ordering::SeqCst)
    }

    pub fn worker_capacity(&self) -> usize {
        self.inner.opts.worker_count
    }

    /// Deliveries currently being handled or settled.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_running() && self.running_workers() > 0
    }

    /// Number of times the subscriber has been started.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &SubscribeOptions {
        &self.inner.opts
    }
}

async fn run_worker(inner: Arc<Inner>, worker_id: usize, shutdown: Shutdown, tracker: Tracker) {
    inner.active_workers.fetch_add(1, Ordering::SeqCst);
    let mut backoff = ConsumeBackoff::default();

    while !shutdown.is_cancelled() {
        match inner.consume(worker_id, &shutdown, &tracker).await {
            Ok(()) => backoff.reset(),
            Err(err) => {
                let delay = backoff.next_delay();
                let failures = backoff.consecutive_failures();
                if failures >= 10 {
                    error!(worker_id, failures, error = %err, retry_in = ?delay, "Worker keeps failing to consume");
                } else {
                    warn!(worker_id, failures, error = %err, retry_in = ?delay, "Worker consume error");
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    inner.active_workers.fetch_sub(1, Ordering::SeqCst);
    debug!(worker_id, "Worker exited");
}

impl Inner {
    fn lock_run(&self) -> MutexGuard<'_, Option<RunState>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One consume cycle: returns `Ok` when the delivery stream ends or shutdown fires.
    async fn consume(
        self: &Arc<Self>,
        worker_id: usize,
        shutdown: &Shutdown,
        tracker: &Tracker,
    ) -> Result<()> {
        let channel = self.channels[worker_id].get_channel().await?;

        let queue_opts = self.opts.queue_opts.clone().unwrap_or_default();
        channel
            .queue_declare(
                &self.opts.queue_name,
                queue_opts.declare_options(),
                queue_opts.arguments,
            )
            .await
            .map_err(|e| RabbitMQError::channel("failed to declare queue", e))?;

        let consumer_tag = format!(
            "{}-{}-{}",
            self.opts.consumer_name,
            worker_id,
            Utc::now().timestamp()
        );
        let mut consumer = channel
            .basic_consume(
                &self.opts.queue_name,
                &consumer_tag,
                self.opts.consume_options(),
                self.opts.args.clone(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::ConsumeError(format!("worker {} failed to start consuming: {}", worker_id, e))
            })?;

        let pool = Arc::new(Semaphore::new(self.opts.pool_size()));
        info!(worker_id, queue = %self.opts.queue_name, %consumer_tag, "Worker consuming");

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(worker_id, "Worker stopping");
                    return Ok(());
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => {
                        return Err(RabbitMQError::ConsumeError(format!("delivery stream failed: {}", err)));
                    }
                    None => {
                        debug!(worker_id, "Delivery stream ended");
                        return Ok(());
                    }
                },
            };

            // Blocks while every slot is busy; the broker stops sending once prefetch is reached.
            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    if self.opts.auto_ack {
                        warn!(worker_id, delivery_tag = delivery.delivery_tag, "Dropping auto-acked delivery at shutdown");
                    }
                    return Ok(());
                }
                permit = pool.clone().acquire_owned() => permit.map_err(|_| {
                    RabbitMQError::ConsumeError("processing pool closed".to_string())
                })?,
            };

            let inner = self.clone();
            let shutdown = shutdown.clone();
            let tracker = tracker.clone();
            inner.in_flight.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                inner.process(worker_id, delivery, &shutdown, &tracker).await;
                inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }
    }

    async fn process(
        self: &Arc<Self>,
        worker_id: usize,
        delivery: Delivery,
        shutdown: &Shutdown,
        tracker: &Tracker,
    ) {
        let settlement = self.evaluate(worker_id, &delivery).await;
        if let Err(err) = self
            .execute(worker_id, delivery, settlement, shutdown, tracker)
            .await
        {
            error!(worker_id, error = %err, "Failed to settle message");
        }
    }

    /// Run the handler under the processing deadline and decide the settlement.
    async fn evaluate(&self, worker_id: usize, delivery: &Delivery) -> Settlement {
        let outcome = run_handler(
            self.handler.handle(delivery),
            self.opts.processing_timeout,
        )
        .await;

        match &outcome {
            HandlerOutcome::Failure(err) => {
                error!(worker_id, delivery_tag = delivery.delivery_tag, error = %err, "Handler failed")
            }
            HandlerOutcome::Expired => {
                let err = RabbitMQError::TimeoutError(format!(
                    "handler exceeded {:?}",
                    self.opts.processing_timeout
                ));
                error!(
                    worker_id,
                    delivery_tag = delivery.delivery_tag,
                    error = %err,
                    "Message processing timed out, rejecting without requeue"
                )
            }
            HandlerOutcome::Success(_) => {}
        }

        settle(
            &delivery.properties,
            delivery.redelivered,
            &self.opts,
            outcome,
            Utc::now(),
        )
    }

    async fn execute(
        self: &Arc<Self>,
        worker_id: usize,
        delivery: Delivery,
        settlement: Settlement,
        shutdown: &Shutdown,
        tracker: &Tracker,
    ) -> Result<()> {
        match settlement {
            Settlement::Ack { reply } => {
                if let Some(reply) = reply {
                    // The call is acked even when the reply cannot be sent.
                    if let Err(err) = self.send_reply(worker_id, &reply).await {
                        error!(worker_id, correlation_id = %reply.correlation_id, error = %err, "Failed to send RPC reply");
                    }
                }
                self.ack(&delivery).await
            }
            Settlement::Retry {
                retry_count,
                delay,
                properties,
            } => {
                self.ack(&delivery).await?;
                info!(worker_id, retry_count, ?delay, "Scheduling retry");
                self.schedule_retry(
                    worker_id,
                    properties,
                    delivery.data,
                    delay,
                    shutdown.clone(),
                    tracker.clone(),
                );
                Ok(())
            }
            Settlement::DeadLetter { properties } => {
                self.ack(&delivery).await?;
                self.publish_dead_letter(worker_id, properties, &delivery.data)
                    .await
            }
            Settlement::Reject => {
                if self.opts.auto_ack {
                    return Ok(());
                }
                delivery
                    .acker
                    .reject(BasicRejectOptions { requeue: false })
                    .await
                    .map_err(|e| RabbitMQError::ack("failed to reject message", e))
            }
            Settlement::Expired => {
                if self.opts.auto_ack {
                    return Ok(());
                }
                delivery
                    .acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await
                    .map_err(|e| RabbitMQError::ack("failed to nack timed out message", e))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if self.opts.auto_ack {
            return Ok(());
        }
        delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::ack("failed to acknowledge message", e))
    }

    async fn send_reply(&self, worker_id: usize, reply: &RpcReply) -> Result<()> {
        let envelope = reply.envelope()?;
        let channel = self.channels[worker_id].get_channel().await?;
        channel
            .basic_publish(
                "",
                &reply.reply_to,
                BasicPublishOptions::default(),
                &envelope.body,
                envelope.properties,
            )
            .await
            .map_err(|e| RabbitMQError::publish("failed to send reply", e))?;

        debug!(worker_id, correlation_id = %reply.correlation_id, reply_to = %reply.reply_to, "Sent RPC reply");
        Ok(())
    }

    fn schedule_retry(
        self: &Arc<Self>,
        worker_id: usize,
        properties: BasicProperties,
        body: Vec<u8>,
        delay: Duration,
        shutdown: Shutdown,
        tracker: Tracker,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            let _tracker = tracker;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!(worker_id, ?delay, "Shutdown cancelled a pending retry, message dropped");
                    return;
                }
                _ = sleep(delay) => {}
            }

            if let Err(err) = inner.republish(worker_id, properties, &body).await {
                error!(worker_id, error = %err, "Failed to republish message after delay");
            }
        });
    }

    async fn republish(&self, worker_id: usize, properties: BasicProperties, body: &[u8]) -> Result<()> {
        let channel = self.channels[worker_id].get_channel().await?;
        channel
            .basic_publish(
                "",
                &self.opts.queue_name,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::publish("failed to republish message", e))?;
        Ok(())
    }

    async fn publish_dead_letter(
        &self,
        worker_id: usize,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<()> {
        let channel = self.channels[worker_id].get_channel().await?;
        self.dead_letter_ready
            .get_or_try_init(|| self.declare_dead_letter(&channel))
            .await?;

        channel
            .basic_publish(
                &self.opts.dead_letter_name,
                &self.opts.queue_name,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::publish("failed to publish to dead letter exchange", e))?;

        info!(
            worker_id,
            dead_letter = %self.opts.dead_letter_name,
            max_retries = self.opts.max_retry_attempts,
            "Moved message to dead letter queue"
        );
        Ok(())
    }

    /// Direct exchange and durable queue, both named after the dead-letter name,
    /// bound with the original queue name as routing key.
    async fn declare_dead_letter(&self, channel: &Channel) -> Result<()> {
        let name = &self.opts.dead_letter_name;
        channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::channel("failed to declare dead letter exchange", e))?;

        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::channel("failed to declare dead letter queue", e))?;

        channel
            .queue_bind(
                name,
                name,
                &self.opts.queue_name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::channel("failed to bind dead letter queue", e))?;

        info!(dead_letter = %name, "Dead letter topology declared");
        Ok(())
    }
}
