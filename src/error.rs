//! Client error type.

use serde_json::Value;

use crate::protocol::{INVALID_SESSION_CODE, RpcErrorBody};

/// Errors surfaced by [`MediaClient`](crate::MediaClient) operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A required argument was empty or missing. Raised before anything is
    /// sent on the wire.
    #[error("{name} is required")]
    MissingArgument {
        /// Name of the missing argument.
        name: &'static str,
    },

    /// The connection was closed or replaced while the call was in flight.
    /// The call was not retried; re-issue it if desired.
    #[error("connection with the media server has been interrupted")]
    ConnectionInterrupted,

    /// The client was explicitly closed; no further calls are possible.
    #[error("client has been closed")]
    ClientClosed,

    /// The server rejected the call.
    #[error("{message}")]
    Server {
        /// Numeric server error code.
        code: i64,
        /// Server-provided message.
        message: String,
        /// Optional structured details.
        data: Option<Value>,
    },

    /// The underlying WebSocket send or connection failed.
    #[error("websocket transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// `unsubscribe` succeeded on the server but the subscription was not in
    /// the client's bookkeeping (stale or unknown id).
    #[error("subscription \"{subscription}\" not found on \"{object}\"")]
    SubscriptionNotFound {
        /// The server-assigned subscription id.
        subscription: String,
        /// The remote object id.
        object: String,
    },
}

impl ClientError {
    /// Numeric server error code, if this is a server-reported error.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this is the reserved invalid-session error.
    pub fn is_invalid_session(&self) -> bool {
        self.code() == Some(INVALID_SESSION_CODE)
    }

    pub(crate) fn from_error_body(body: RpcErrorBody) -> Self {
        Self::Server {
            code: body.code,
            message: body.message,
            data: body.data,
        }
    }
}
