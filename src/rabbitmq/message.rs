use chrono::{DateTime, Utc};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::Result;

pub const CONTENT_TYPE_TEXT: &str = "text/plain";
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT: u8 = 2;

/// Header carrying the message id on every publish.
pub const ID_HEADER: &str = "id";

const ID_RANDOM_LEN: usize = 21;

/// What a message carries. The variant decides both the wire bytes and the content type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent as raw UTF-8, `text/plain`
    Text(String),
    /// Sent as-is, `application/octet-stream`
    Bytes(Vec<u8>),
    /// JSON-encoded, `application/json`
    Json(Value),
}

impl Payload {
    /// Serialize any value into a JSON payload.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Text(_) => CONTENT_TYPE_TEXT,
            Payload::Bytes(_) => CONTENT_TYPE_BINARY,
            Payload::Json(_) => CONTENT_TYPE_JSON,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Payload::Text(text) => text.as_bytes().to_vec(),
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::Json(value) => serde_json::to_vec(value)?,
        })
    }

    /// The payload as a JSON value, for embedding inside RPC envelopes.
    /// Bytes become an array of numbers.
    pub fn to_value(&self) -> Value {
        match self {
            Payload::Text(text) => Value::String(text.clone()),
            Payload::Bytes(bytes) => Value::from(bytes.clone()),
            Payload::Json(value) => value.clone(),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Body of an RPC call: `{pattern, data, id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcBody {
    pub pattern: String,
    pub data: Value,
    pub id: String,
}

/// Body of an RPC reply. Empty fields are left off the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(rename = "isDisposed", default, skip_serializing_if = "is_false")]
    pub is_disposed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl RpcResponse {
    pub const STATUS_ERROR: &'static str = "error";

    pub fn success(response: Value) -> Self {
        Self {
            is_disposed: true,
            response: Some(response).filter(|value| !value.is_null()),
            ..Self::default()
        }
    }

    pub fn failure(err: impl Into<String>) -> Self {
        Self {
            err: Some(err.into()),
            status: Some(Self::STATUS_ERROR.to_string()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.status.as_deref() == Some(Self::STATUS_ERROR)
    }

    /// Split into the handler's response or its error text.
    pub fn into_result(self) -> std::result::Result<Option<Value>, String> {
        if self.is_error() {
            Err(self.err.unwrap_or_default())
        } else {
            Ok(self.response)
        }
    }
}

/// A ready-to-publish body plus its AMQP properties.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

/// An outgoing message. Built once per publish; the generators return amended
/// copies and never mutate the message itself.
#[derive(Debug, Clone)]
pub struct Message {
    id: String,
    body: Vec<u8>,
    payload: Payload,
    headers: FieldTable,
    timestamp: DateTime<Utc>,
    content_type: &'static str,
}

impl Message {
    pub fn new(payload: impl Into<Payload>, headers: Option<FieldTable>) -> Result<Self> {
        let payload = payload.into();
        let body = payload.encode()?;
        let timestamp = Utc::now();

        Ok(Message {
            id: generate_message_id(timestamp),
            body,
            content_type: payload.content_type(),
            payload,
            headers: headers.unwrap_or_default(),
            timestamp,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn headers(&self) -> &FieldTable {
        &self.headers
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    fn base_properties(&self, headers: FieldTable) -> BasicProperties {
        BasicProperties::default()
            .with_content_type(self.content_type.into())
            .with_timestamp(self.timestamp.timestamp().max(0) as u64)
            .with_delivery_mode(PERSISTENT)
            .with_headers(headers)
    }

    /// Persistent publishing with the id stamped into `message_id` and the `id` header.
    pub fn generate_payload(&self) -> Envelope {
        let mut headers = self.headers.clone();
        headers.insert(
            ID_HEADER.into(),
            AMQPValue::LongString(self.id.clone().into()),
        );

        Envelope {
            body: self.body.clone(),
            properties: self
                .base_properties(headers)
                .with_message_id(self.id.clone().into()),
        }
    }

    /// Wrap the payload as `{pattern, data, id}`, expecting the reply on `reply_to`
    /// correlated by the message id.
    pub fn generate_rpc_payload(&self, reply_to: &str, pattern: &str) -> Result<Envelope> {
        let body = serde_json::to_vec(&RpcBody {
            pattern: pattern.to_string(),
            data: self.payload.to_value(),
            id: self.id.clone(),
        })?;

        Ok(Envelope {
            body,
            properties: self
                .base_properties(self.headers.clone())
                .with_message_id(self.id.clone().into())
                .with_reply_to(reply_to.into())
                .with_correlation_id(self.id.clone().into()),
        })
    }

    /// Re-read the payload as an [`RpcResponse`] and address it to `correlation_id`.
    pub fn generate_rpc_reply_payload(&self, correlation_id: &str) -> Result<Envelope> {
        let mut response = match &self.payload {
            Payload::Json(value) => serde_json::from_value::<RpcResponse>(value.clone())?,
            other => RpcResponse::success(other.to_value()),
        };
        response.id = correlation_id.to_string();
        let body = serde_json::to_vec(&response)?;

        Ok(Envelope {
            body,
            properties: self
                .base_properties(self.headers.clone())
                .with_correlation_id(correlation_id.into()),
        })
    }
}

/// `msg_<random>_<unix seconds>`
pub fn generate_message_id(at: DateTime<Utc>) -> String {
    let random: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ID_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("msg_{}_{}", random, at.timestamp())
}

pub fn header<'a>(headers: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    headers.inner().get(&ShortString::from(key))
}

/// Read an integer header regardless of the width the publisher chose.
pub fn header_int(headers: &FieldTable, key: &str) -> Option<i64> {
    match header(headers, key)? {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

pub fn header_string(headers: &FieldTable, key: &str) -> Option<String> {
    match header(headers, key)? {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_string()),
        _ => None,
    }
}
