//! In-flight call tracking, keyed by correlation id.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::router::Subscription;

/// Reply channel for a plain call.
pub(crate) type CallReply = oneshot::Sender<Result<Value, ClientError>>;

/// How to shape a raw `result` object before handing it to the caller.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Extract {
    /// Pass the result through unchanged.
    Raw,
    /// Take the `value` field (`create`, `invoke`, `ping`, `subscribe`).
    Value,
    /// Discard the result (`release`, `unsubscribe`).
    Unit,
}

impl Extract {
    pub(crate) fn apply(self, result: Value) -> Value {
        match self {
            Self::Raw => result,
            Self::Value => result.get("value").cloned().unwrap_or(Value::Null),
            Self::Unit => Value::Null,
        }
    }
}

/// What to do when the response for a pending call arrives.
pub(crate) enum PendingKind {
    /// Ordinary caller-issued call.
    Call {
        reply: CallReply,
        extract: Extract,
    },
    /// `subscribe` call; on success the router entry is created before the
    /// caller is told the subscription id.
    Subscribe {
        object: String,
        event_type: String,
        reply: oneshot::Sender<Result<Subscription, ClientError>>,
    },
    /// `unsubscribe` call; on success the router entries are removed.
    Unsubscribe {
        subscription: String,
        object: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    /// Internal `connect {sessionId}` issued on reconnect to resume the
    /// server-side session. No caller to notify.
    SessionResume,
    /// Internal fresh `connect` issued after the server invalidated the
    /// session.
    SessionFresh,
}

/// One outstanding request on the current connection.
pub(crate) struct PendingCall {
    /// Method name, kept for diagnostics only.
    pub(crate) method: String,
    /// Request params, kept for diagnostics only.
    pub(crate) params: Value,
    pub(crate) kind: PendingKind,
}

/// Tracks in-flight requests. Entries only ever belong to the current
/// connection; the id counter spans the client's whole lifetime and is
/// never reused.
pub(crate) struct CallRegistry {
    next_id: u64,
    pending: HashMap<u64, PendingCall>,
}

impl CallRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate the next correlation id.
    pub(crate) fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register a call that was successfully written to the socket.
    pub(crate) fn register(&mut self, id: u64, call: PendingCall) {
        let _ = self.pending.insert(id, call);
    }

    /// Take the pending call for a response id. `None` covers late
    /// responses for calls already invalidated by a close.
    pub(crate) fn complete(&mut self, id: u64) -> Option<PendingCall> {
        self.pending.remove(&id)
    }

    /// Remove and return every pending call, for bulk invalidation when the
    /// connection goes away.
    pub(crate) fn drain(&mut self) -> Vec<PendingCall> {
        self.pending.drain().map(|(_, call)| call).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
