//! JSON-RPC helpers shared by all transports.
//!
//! Framing (request/notification construction), response unwrapping, and the
//! initialize handshake parameters live here so the transports agree on the
//! wire shape.

use crate::error::{Error, Result};
use crate::types::{JSONRPCNotification, JSONRPCRequest, JSONRPCResponse, JSONRPC_VERSION};
use serde_json::{json, Value};

/// Build a JSON-RPC request frame.
pub fn build_request(method: &str, params: Option<Value>, id: i64) -> JSONRPCRequest {
    JSONRPCRequest {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id: id.into(),
        method: method.to_string(),
        params,
    }
}

/// Build a JSON-RPC notification frame.
pub fn build_notification(method: &str, params: Option<Value>) -> JSONRPCNotification {
    JSONRPCNotification {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: method.to_string(),
        params,
    }
}

/// Unwrap a JSON-RPC response into its result.
///
/// A response carrying an `error` object becomes [`Error::Server`] with the
/// peer's message and code. A response with neither field yields `null`.
pub fn process_response(response: JSONRPCResponse) -> Result<Value> {
    if let Some(error) = response.error {
        return Err(Error::server(error.message, Some(error.code)));
    }
    Ok(response.result.unwrap_or(Value::Null))
}

/// Parameters for the `initialize` request.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": crate::PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": crate::CLIENT_NAME,
            "version": crate::CLIENT_VERSION,
        },
    })
}
