//! JSON-RPC 2.0 message envelopes.
//!
//! All transports exchange these three frame shapes; [`parse_message`]
//! classifies an incoming frame so readers can route it to the pending
//! request table or the notification listeners.

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier.
///
/// Outbound requests always use monotonically increasing numbers scoped to
/// the transport instance; the string form exists because peers are allowed
/// to answer with (or originate) string ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(i64),
    /// String id.
    String(String),
}

impl RequestId {
    /// Numeric value, when this id is numeric.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(_) => None,
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// A JSON-RPC request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCRequest {
    /// Always "2.0".
    pub jsonrpc: String,
    /// Request id, unique while the request is pending.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Parameters; omitted from the wire when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A JSON-RPC notification frame (a request without an id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCNotification {
    /// Always "2.0".
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Parameters; omitted from the wire when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC error object carried in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCError {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC response frame carrying either a result or an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCResponse {
    /// Always "2.0".
    pub jsonrpc: String,
    /// Id of the request being answered.
    pub id: RequestId,
    /// Successful result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object when the request failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JSONRPCError>,
}

/// A classified inbound frame.
#[derive(Debug, Clone)]
pub enum Message {
    /// Server-originated request (unexpected for a pure client; logged and
    /// ignored by the transports).
    Request(JSONRPCRequest),
    /// Server-originated notification.
    Notification(JSONRPCNotification),
    /// Response to one of our requests.
    Response(JSONRPCResponse),
}

/// Parse raw bytes into a classified JSON-RPC message.
///
/// Frames with a `method` field are requests (with `id`) or notifications
/// (without); frames with `result` or `error` are responses. Anything else
/// is malformed.
pub fn parse_message(raw: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| TransportError::InvalidMessage(format!("invalid JSON: {e}")))?;

    if value.get("method").is_some() {
        if value.get("id").is_some() {
            let request: JSONRPCRequest = serde_json::from_value(value)
                .map_err(|e| TransportError::InvalidMessage(format!("invalid request: {e}")))?;
            Ok(Message::Request(request))
        } else {
            let notification: JSONRPCNotification = serde_json::from_value(value)
                .map_err(|e| TransportError::InvalidMessage(format!("invalid notification: {e}")))?;
            Ok(Message::Notification(notification))
        }
    } else if value.get("result").is_some() || value.get("error").is_some() {
        let response: JSONRPCResponse = serde_json::from_value(value)
            .map_err(|e| TransportError::InvalidMessage(format!("invalid response: {e}")))?;
        Ok(Message::Response(response))
    } else {
        Err(TransportError::InvalidMessage("unknown message type".to_string()).into())
    }
}
