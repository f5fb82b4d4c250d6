//! JSON-RPC 2.0 wire-format types for the media server control protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version carried in every outgoing request.
pub const JSONRPC_VERSION: &str = "2.0";

/// The only server-initiated notification method the client recognizes.
pub const ON_EVENT_METHOD: &str = "onEvent";

/// Server error code signalling that the replayed session id is no longer
/// valid and all session-scoped state must be renegotiated.
pub const INVALID_SESSION_CODE: i64 = 40007;

/// Outgoing RPC request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Correlation id, unique for the lifetime of the client.
    pub id: u64,
    /// Method name (e.g. `create`, `invoke`, `subscribe`).
    pub method: String,
    /// Parameters object.
    pub params: Value,
}

impl RpcRequest {
    /// Build a request for the given correlation id.
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Incoming RPC response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Echoed correlation id.
    pub id: u64,
    /// Result payload (present on success).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload (present on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

/// Structured error body inside an [`RpcResponse`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Numeric error code (e.g. [`INVALID_SESSION_CODE`]).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Incoming server-initiated notification (carries a `method`, no `id`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcNotification {
    /// Notification method name.
    pub method: String,
    /// Notification parameters.
    pub params: Value,
}

/// Any frame the server can send: a response to one of our calls, or a
/// notification it initiated. Distinguished by the presence of `method`.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Response correlated to an outstanding request.
    Response(RpcResponse),
    /// Server-pushed notification.
    Notification(RpcNotification),
}

/// `onEvent` notification params wrapper: `{value: {...}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The event itself.
    pub value: RemoteEvent,
}

/// An event emitted by a remote object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteEvent {
    /// Id of the remote object that emitted the event.
    pub object: String,
    /// Event type name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}
