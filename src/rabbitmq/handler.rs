use async_trait::async_trait;
use futures::FutureExt;
use lapin::{message::Delivery, BasicProperties};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tokio::time::timeout;

use super::message::RpcBody;
use super::outcome::HandlerOutcome;

/// Business logic plugged into a [`Subscriber`](super::Subscriber).
///
/// The returned value becomes the RPC response when the delivery is an RPC call
/// and is ignored otherwise. An `Err` sends the delivery down the retry path
/// (or back to the caller as an error reply).
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<Value>;
}

/// Adapts a plain function over the body and properties.
///
/// The function runs on Tokio's blocking pool, so it may block without stalling
/// other workers and the processing deadline still applies to it.
pub struct FnHandler<F> {
    f: Arc<F>,
}

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&[u8], &BasicProperties) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    FnHandler { f: Arc::new(f) }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&[u8], &BasicProperties) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<Value> {
        let f = Arc::clone(&self.f);
        let body = delivery.data.clone();
        let properties = delivery.properties.clone();
        run_blocking(move || (*f)(&body, &properties)).await
    }
}

/// Decodes the body as `T` and serializes the `R` it produces.
///
/// RPC bodies (`{pattern, data, id}`) are unwrapped so `T` only sees `data`.
/// Like [`FnHandler`], the function runs on the blocking pool.
pub struct JsonHandler<T, R, F> {
    f: Arc<F>,
    _types: PhantomData<fn(T) -> R>,
}

pub fn json_handler<T, R, F>(f: F) -> JsonHandler<T, R, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(T) -> anyhow::Result<R> + Send + Sync + 'static,
{
    JsonHandler {
        f: Arc::new(f),
        _types: PhantomData,
    }
}

fn decode_and_call<T, R, F>(f: &F, body: &[u8], is_rpc: bool) -> anyhow::Result<Value>
where
    T: DeserializeOwned,
    R: Serialize,
    F: Fn(T) -> anyhow::Result<R>,
{
    let input: T = if is_rpc {
        serde_json::from_value(serde_json::from_slice::<RpcBody>(body)?.data)?
    } else {
        serde_json::from_slice(body)?
    };
    Ok(serde_json::to_value(f(input)?)?)
}

#[async_trait]
impl<T, R, F> MessageHandler for JsonHandler<T, R, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(T) -> anyhow::Result<R> + Send + Sync + 'static,
{
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<Value> {
        let is_rpc = delivery
            .properties
            .correlation_id()
            .as_ref()
            .is_some_and(|id| !id.as_str().is_empty());
        let f = Arc::clone(&self.f);
        let body = delivery.data.clone();
        run_blocking(move || decode_and_call::<T, R, F>(&*f, &body, is_rpc)).await
    }
}

/// Run `work` on the blocking pool. A panic is resumed on the calling task so
/// [`run_handler`] reports it like any other handler panic.
///
/// Dropping the returned future does not stop `work`; it runs to completion
/// detached.
async fn run_blocking<W>(work: W) -> anyhow::Result<Value>
where
    W: FnOnce() -> anyhow::Result<Value> + Send + 'static,
{
    match task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        Err(err) => Err(anyhow::anyhow!("handler task failed: {}", err)),
    }
}

/// Drive one handler invocation to an outcome.
///
/// Panics are caught and reported as failures. Past `deadline` the future is
/// dropped and the outcome is [`HandlerOutcome::Expired`].
pub(crate) async fn run_handler<Fut>(work: Fut, deadline: Duration) -> HandlerOutcome
where
    Fut: Future<Output = anyhow::Result<Value>>,
{
    match timeout(deadline, AssertUnwindSafe(work).catch_unwind()).await {
        Err(_) => HandlerOutcome::Expired,
        Ok(Err(panic)) => HandlerOutcome::Failure(format!("handler panicked: {}", panic_message(&*panic))),
        Ok(Ok(Err(err))) => HandlerOutcome::Failure(format!("{:#}", err)),
        Ok(Ok(Ok(value))) => HandlerOutcome::Success(value),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
