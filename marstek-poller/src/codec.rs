//! Wire format of the battery UDP API
//!
//! Requests are `{"id": <int>, "method": <string>, "params": {..}}`, replies
//! carry either `result` or `error`. Batteries sometimes send the request
//! straight back; [`EncodedRequest::is_echo`] recognizes those copies.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

/// Status read used by the poll cycle (the only method that answers reliably)
pub const STATUS_METHOD: &str = "ES.GetMode";

/// Parameters of the status read
pub fn status_params() -> Value {
    json!({ "id": 0 })
}

#[derive(Serialize)]
struct RequestFrame<'a> {
    id: u64,
    method: &'a str,
    params: &'a Value,
}

/// A serialized request, kept around to recognize its echo
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    id: u64,
    bytes: Vec<u8>,
    canonical: Value,
}

impl EncodedRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// True when `datagram` is this request sent back, byte for byte or as equal JSON
    pub fn is_echo(&self, datagram: &[u8]) -> bool {
        if datagram == self.bytes.as_slice() {
            return true;
        }
        serde_json::from_slice::<Value>(datagram)
            .map(|value| value == self.canonical)
            .unwrap_or(false)
    }
}

/// Serializes a request. Same inputs always give the same bytes.
pub fn encode(method: &str, params: &Value, id: u64) -> Result<EncodedRequest, serde_json::Error> {
    let frame = RequestFrame { id, method, params };
    let bytes = serde_json::to_vec(&frame)?;
    let canonical = serde_json::to_value(&frame)?;
    Ok(EncodedRequest { id, bytes, canonical })
}

/// Error object of a rejected request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Map<String, Value>),
    Error(RpcError),
}

/// A decoded reply
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: u64,
    pub outcome: Outcome,
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not a JSON reply: {0}")]
    Json(#[from] serde_json::Error),
    #[error("reply has no numeric id")]
    MissingId,
    #[error("reply has neither result nor error")]
    MissingOutcome,
    #[error("reply result is not an object")]
    ResultNotObject,
}

#[derive(Deserialize)]
struct RawReply {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RpcError>,
}

/// Parses an inbound datagram
pub fn decode(datagram: &[u8]) -> Result<Reply, DecodeError> {
    let raw: RawReply = serde_json::from_slice(datagram)?;
    let id = raw.id.ok_or(DecodeError::MissingId)?;

    let outcome = match (raw.error, raw.result) {
        (Some(error), _) => Outcome::Error(error),
        (None, Some(Value::Object(result))) => Outcome::Success(result),
        (None, Some(_)) => return Err(DecodeError::ResultNotObject),
        (None, None) => return Err(DecodeError::MissingOutcome),
    };

    Ok(Reply { id, outcome })
}
