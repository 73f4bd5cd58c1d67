//! What to do with a delivery once its handler has finished.
//!
//! [`settle`] only looks at the delivery's properties and the handler result, so the
//! whole ack / retry / dead-letter / reply policy can be tested without a broker. The
//! subscriber carries out the returned [`Settlement`].

use chrono::{DateTime, SecondsFormat, Utc};
use lapin::{
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use super::errors::Result;
use super::message::{header_int, Envelope, Message, Payload, RpcResponse};
use super::options::SubscribeOptions;

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const DEATH_REASON_HEADER: &str = "x-death-reason";
pub const DEATH_TIME_HEADER: &str = "x-death-time";
pub const DEATH_QUEUE_HEADER: &str = "x-death-queue";
pub const DEATH_MAX_RETRIES_HEADER: &str = "x-death-max-retries";

/// How a handler invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Success(Value),
    /// Returned an error or panicked
    Failure(String),
    /// Still running at the processing deadline
    Expired,
}

/// A reply owed to an RPC caller. Carries the request's headers back.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcReply {
    pub reply_to: String,
    pub correlation_id: String,
    pub response: RpcResponse,
    pub headers: FieldTable,
}

impl RpcReply {
    pub fn envelope(&self) -> Result<Envelope> {
        let message = Message::new(Payload::json(&self.response)?, Some(self.headers.clone()))?;
        message.generate_rpc_reply_payload(&self.correlation_id)
    }
}

#[derive(Debug, Clone)]
pub enum Settlement {
    /// Ack, sending `reply` first when there is one
    Ack { reply: Option<RpcReply> },
    /// Ack, then republish `properties` to the queue once `delay` has passed
    Retry {
        retry_count: u32,
        delay: Duration,
        properties: BasicProperties,
    },
    /// Ack and publish a copy carrying `properties` to the dead-letter exchange
    DeadLetter { properties: BasicProperties },
    /// Reject without requeue
    Reject,
    /// Nack without requeue; headers are left alone
    Expired,
}

/// Attempts already made for a delivery, as recorded in `x-retry-count`.
///
/// A redelivered message with no recorded attempts has been tried once.
pub fn delivery_count(properties: &BasicProperties, redelivered: bool) -> u32 {
    let recorded = properties
        .headers()
        .as_ref()
        .and_then(|headers| header_int(headers, RETRY_COUNT_HEADER))
        .map(|count| u32::try_from(count.max(0)).unwrap_or(u32::MAX))
        .unwrap_or(0);

    if recorded == 0 && redelivered {
        1
    } else {
        recorded
    }
}

pub fn settle(
    properties: &BasicProperties,
    redelivered: bool,
    opts: &SubscribeOptions,
    outcome: HandlerOutcome,
    now: DateTime<Utc>,
) -> Settlement {
    let err = match outcome {
        HandlerOutcome::Expired => return Settlement::Expired,
        HandlerOutcome::Success(value) => {
            return Settlement::Ack {
                reply: rpc_reply(properties, || RpcResponse::success(value)),
            }
        }
        HandlerOutcome::Failure(err) => err,
    };

    if correlation_id(properties).is_some() {
        return Settlement::Ack {
            reply: rpc_reply(properties, || RpcResponse::failure(err)),
        };
    }

    let count = delivery_count(properties, redelivered);
    if count >= opts.max_retry_attempts {
        if !opts.enable_dead_letter {
            return Settlement::Reject;
        }
        return Settlement::DeadLetter {
            properties: dead_letter_properties(properties, opts, &err, now),
        };
    }

    let retry_count = count + 1;
    Settlement::Retry {
        retry_count,
        delay: opts.retry_delay(retry_count),
        properties: retry_properties(properties, retry_count),
    }
}

fn correlation_id(properties: &BasicProperties) -> Option<&str> {
    properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str())
        .filter(|id| !id.is_empty())
}

fn reply_to(properties: &BasicProperties) -> Option<&str> {
    properties
        .reply_to()
        .as_ref()
        .map(|to| to.as_str())
        .filter(|to| !to.is_empty())
}

fn rpc_reply(
    properties: &BasicProperties,
    response: impl FnOnce() -> RpcResponse,
) -> Option<RpcReply> {
    let correlation_id = correlation_id(properties)?;
    match reply_to(properties) {
        Some(reply_to) => Some(RpcReply {
            reply_to: reply_to.to_string(),
            correlation_id: correlation_id.to_string(),
            response: response(),
            headers: properties.headers().clone().unwrap_or_default(),
        }),
        None => {
            warn!(correlation_id, "RPC message has no reply_to, acking without a reply");
            None
        }
    }
}

fn amended(properties: &BasicProperties, stamp: impl FnOnce(&mut FieldTable)) -> BasicProperties {
    let mut headers = properties.headers().clone().unwrap_or_default();
    stamp(&mut headers);
    properties.clone().with_headers(headers)
}

pub fn retry_properties(properties: &BasicProperties, retry_count: u32) -> BasicProperties {
    amended(properties, |headers| {
        headers.insert(
            RETRY_COUNT_HEADER.into(),
            AMQPValue::LongLongInt(i64::from(retry_count)),
        );
    })
}

pub fn dead_letter_properties(
    properties: &BasicProperties,
    opts: &SubscribeOptions,
    reason: &str,
    now: DateTime<Utc>,
) -> BasicProperties {
    amended(properties, |headers| {
        headers.insert(
            DEATH_REASON_HEADER.into(),
            AMQPValue::LongString(reason.into()),
        );
        headers.insert(
            DEATH_TIME_HEADER.into(),
            AMQPValue::LongString(now.to_rfc3339_opts(SecondsFormat::Secs, true).into()),
        );
        headers.insert(
            DEATH_QUEUE_HEADER.into(),
            AMQPValue::LongString(opts.queue_name.as_str().into()),
        );
        headers.insert(
            DEATH_MAX_RETRIES_HEADER.into(),
            AMQPValue::LongLongInt(i64::from(opts.max_retry_attempts)),
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::message::header_string;
    use crate::rabbitmq::options::RetryStrategy;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn plain(retry_count: Option<i64>) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert("id".into(), AMQPValue::LongString("msg_a_1".into()));
        if let Some(count) = retry_count {
            headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongLongInt(count));
        }
        BasicProperties::default()
            .with_message_id("msg_a_1".into())
            .with_delivery_mode(2)
            .with_headers(headers)
    }

    fn rpc(reply_to: &str) -> BasicProperties {
        BasicProperties::default()
            .with_correlation_id("msg_call_1".into())
            .with_reply_to(reply_to.into())
    }

    fn fixed_opts() -> SubscribeOptions {
        SubscribeOptions::new("orders", false).with_retry_policy(
            RetryStrategy::Fixed,
            Duration::from_secs(5),
            Duration::from_secs(600),
            5,
        )
    }

    fn headers(properties: &BasicProperties) -> FieldTable {
        properties.headers().clone().unwrap_or_default()
    }

    #[test]
    fn test_success_without_rpc_markers_acks() {
        let settlement = settle(
            &plain(None),
            false,
            &fixed_opts(),
            HandlerOutcome::Success(json!({"ok": true})),
            now(),
        );
        assert!(matches!(settlement, Settlement::Ack { reply: None }));
    }

    #[test]
    fn test_rpc_success_replies_with_response() {
        let settlement = settle(
            &rpc("amq.rabbitmq.reply-to"),
            false,
            &fixed_opts(),
            HandlerOutcome::Success(json!({"status": "ok"})),
            now(),
        );
        let Settlement::Ack { reply: Some(reply) } = settlement else {
            panic!("expected a reply, got {:?}", settlement);
        };
        assert_eq!(reply.reply_to, "amq.rabbitmq.reply-to");

        let envelope = reply.envelope().unwrap();
        assert_eq!(
            String::from_utf8(envelope.body).unwrap(),
            r#"{"isDisposed":true,"response":{"status":"ok"},"id":"msg_call_1"}"#
        );
        assert_eq!(
            envelope.properties.correlation_id().as_ref().unwrap().as_str(),
            "msg_call_1"
        );
    }

    #[test]
    fn test_rpc_without_reply_to_acks_only() {
        let props = BasicProperties::default().with_correlation_id("msg_call_1".into());
        let ok = settle(&props, false, &fixed_opts(), HandlerOutcome::Success(json!(1)), now());
        assert!(matches!(ok, Settlement::Ack { reply: None }));

        let failed = settle(
            &props,
            false,
            &fixed_opts(),
            HandlerOutcome::Failure("boom".to_string()),
            now(),
        );
        assert!(matches!(failed, Settlement::Ack { reply: None }));
    }

    #[test]
    fn test_rpc_failure_replies_with_error_and_never_retries() {
        let props = rpc("reply.queue").with_headers({
            let mut headers = FieldTable::default();
            headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongLongInt(99));
            headers
        });
        let settlement = settle(
            &props,
            true,
            &fixed_opts(),
            HandlerOutcome::Failure("user not found".to_string()),
            now(),
        );
        let Settlement::Ack { reply: Some(reply) } = settlement else {
            panic!("expected an error reply, got {:?}", settlement);
        };
        assert!(reply.response.is_error());
        assert_eq!(reply.response.err.as_deref(), Some("user not found"));

        let body: Value = serde_json::from_slice(&reply.envelope().unwrap().body).unwrap();
        assert_eq!(
            body,
            json!({"id": "msg_call_1", "err": "user not found", "status": "error"})
        );
    }

    #[test]
    fn test_delivery_count() {
        assert_eq!(delivery_count(&plain(None), false), 0);
        assert_eq!(delivery_count(&plain(None), true), 1);
        assert_eq!(delivery_count(&plain(Some(3)), true), 3);
        assert_eq!(delivery_count(&plain(Some(-4)), false), 0);
        assert_eq!(delivery_count(&plain(Some(0)), true), 1);

        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongInt(2));
        let props = BasicProperties::default().with_headers(headers);
        assert_eq!(delivery_count(&props, false), 2);
    }

    #[test]
    fn test_fixed_retry_until_dead_letter() {
        let opts = fixed_opts();
        let mut props = plain(None);

        for attempt in 1..=4u32 {
            match settle(&props, false, &opts, HandlerOutcome::Failure("boom".into()), now()) {
                Settlement::Retry {
                    retry_count,
                    delay,
                    properties,
                } => {
                    assert_eq!(retry_count, attempt);
                    assert_eq!(delay, Duration::from_secs(5));
                    assert_eq!(delivery_count(&properties, false), attempt);
                    props = properties;
                }
                other => panic!("attempt {} should retry, got {:?}", attempt, other),
            }
        }

        // Fifth failure: x-retry-count is 4, one more retry is still allowed.
        let props = match settle(&props, false, &opts, HandlerOutcome::Failure("boom".into()), now()) {
            Settlement::Retry { retry_count, properties, .. } => {
                assert_eq!(retry_count, 5);
                properties
            }
            other => panic!("expected retry, got {:?}", other),
        };

        match settle(&props, false, &opts, HandlerOutcome::Failure("boom".into()), now()) {
            Settlement::DeadLetter { properties } => {
                let headers = headers(&properties);
                assert_eq!(header_string(&headers, DEATH_REASON_HEADER).as_deref(), Some("boom"));
                assert_eq!(header_string(&headers, DEATH_QUEUE_HEADER).as_deref(), Some("orders"));
                assert_eq!(
                    header_string(&headers, DEATH_TIME_HEADER).as_deref(),
                    Some("2024-05-01T12:00:00Z")
                );
                assert_eq!(header_int(&headers, DEATH_MAX_RETRIES_HEADER), Some(5));
                assert_eq!(header_int(&headers, RETRY_COUNT_HEADER), Some(5));
            }
            other => panic!("expected dead letter, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_delay_follows_strategy() {
        let opts = SubscribeOptions::new("orders", false).with_retry_policy(
            RetryStrategy::Exponential,
            Duration::from_secs(1),
            Duration::from_secs(600),
            5,
        );
        match settle(&plain(Some(2)), false, &opts, HandlerOutcome::Failure("x".into()), now()) {
            Settlement::Retry { retry_count, delay, .. } => {
                assert_eq!(retry_count, 3);
                assert_eq!(delay, Duration::from_secs(8));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_preserves_everything_but_headers() {
        let original = plain(Some(1))
            .with_correlation_id("".into())
            .with_content_type("application/json".into());
        let Settlement::Retry { properties, .. } = settle(
            &original,
            false,
            &fixed_opts(),
            HandlerOutcome::Failure("x".into()),
            now(),
        ) else {
            panic!("expected retry");
        };

        assert_eq!(properties.message_id(), original.message_id());
        assert_eq!(properties.content_type(), original.content_type());
        assert_eq!(properties.delivery_mode(), original.delivery_mode());
        let headers = headers(&properties);
        assert_eq!(header_string(&headers, "id").as_deref(), Some("msg_a_1"));
        assert_eq!(header_int(&headers, RETRY_COUNT_HEADER), Some(2));
    }

    #[test]
    fn test_exhausted_without_dead_letter_rejects() {
        let opts = fixed_opts().without_dead_letter();
        let settlement = settle(&plain(Some(5)), false, &opts, HandlerOutcome::Failure("x".into()), now());
        assert!(matches!(settlement, Settlement::Reject));
    }

    #[test]
    fn test_expired_is_terminal_for_every_message() {
        for props in [plain(Some(2)), rpc("reply.queue")] {
            let settlement = settle(&props, true, &fixed_opts(), HandlerOutcome::Expired, now());
            assert!(matches!(settlement, Settlement::Expired));
        }
    }
}
