//! Wire shapes for the request-response protocol and fan-out deliveries.
//!
//! One JSON object per text frame. Responses carry `type: "response"` (or
//! `"persist"` for persistence failures) so clients can tell them apart
//! from deliveries, which have no `type` field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A request sent from a client to the server.
///
/// `id` is the client-chosen correlation key echoed on every frame the
/// request produces. `sender_id` is only authoritative once the server has
/// overwritten it with the session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub require_ack: bool,
    /// Object form of `data`, attached by the data-validation decorator.
    #[serde(skip)]
    pub parsed_data: Option<Map<String, Value>>,
}

/// A response sent back to the requesting client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: String,
    pub action: String,
    /// HTTP-style status: 200, 400, 401, 409, 500.
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "type")]
    pub kind: String,
}

pub const KIND_RESPONSE: &str = "response";
pub const KIND_PERSIST: &str = "persist";

/// Placeholder used when a frame could not be decoded far enough to learn
/// its correlation id or action.
pub const UNKNOWN: &str = "UNKNOWN";

impl Response {
    pub fn ok(request: &Request) -> Self {
        Self {
            id: request.id.clone(),
            action: request.action.clone(),
            code: 200,
            message: None,
            data: None,
            kind: KIND_RESPONSE.to_string(),
        }
    }

    pub fn ok_with_data(request: &Request, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok(request)
        }
    }

    pub fn error(request: &Request, code: u16, message: &str) -> Self {
        Self {
            id: request.id.clone(),
            action: request.action.clone(),
            code,
            message: Some(message.to_string()),
            data: None,
            kind: KIND_RESPONSE.to_string(),
        }
    }

    pub fn persist_error(request: &Request, message: &str) -> Self {
        Self {
            kind: KIND_PERSIST.to_string(),
            ..Self::error(request, 500, message)
        }
    }

    /// 400 answer for frames that failed to decode.
    pub fn decode_failure() -> Self {
        Self {
            id: UNKNOWN.to_string(),
            action: UNKNOWN.to_string(),
            code: 400,
            message: None,
            data: None,
            kind: KIND_RESPONSE.to_string(),
        }
    }
}

/// A frame pushed to a subscriber when a value is published on a topic it
/// subscribes to. Echoes the originating request's id, action and topic;
/// `data` is the canonical JSON of the published value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub id: String,
    pub action: String,
    pub topic: String,
    pub data: Value,
}
