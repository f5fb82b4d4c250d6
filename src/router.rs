//! Routing of server-pushed events to subscriber channels.
//!
//! Two tables, mirroring the two lookups the protocol needs:
//!
//! - `(event type, object)` → the subscriber's event channel, used to
//!   dispatch incoming `onEvent` notifications.
//! - `(subscription id, object)` → event type, used only to find the channel
//!   entry to remove when the caller unsubscribes.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// A live subscription to events of one type from one remote object.
///
/// Dropping (or exhausting) `events` does not unsubscribe server-side; call
/// [`MediaClient::unsubscribe`](crate::MediaClient::unsubscribe) for that.
#[derive(Debug)]
pub struct Subscription {
    /// Server-assigned subscription id, needed to unsubscribe.
    pub id: String,
    /// Stream of event payloads (`data` field of each matching event).
    pub events: mpsc::UnboundedReceiver<Value>,
}

/// Composite key for the event-handler table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct HandlerKey {
    event_type: String,
    object: String,
}

/// Composite key for the subscription-type table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    subscription: String,
    object: String,
}

/// Event dispatch tables for one client instance.
///
/// Mutated only from the client actor; survives reconnects and is cleared
/// only on explicit close or session invalidation.
#[derive(Default)]
pub(crate) struct EventRouter {
    handlers: HashMap<HandlerKey, mpsc::UnboundedSender<Value>>,
    subscriptions: HashMap<SubscriptionKey, String>,
}

impl EventRouter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a subscription, returning the receiver half of its event
    /// channel. Last registration for an `(object, type)` pair wins: any
    /// previous channel is replaced (its receiver sees end-of-stream) and
    /// the stale subscription record pointing at it is dropped.
    pub(crate) fn register(
        &mut self,
        object: &str,
        event_type: &str,
        subscription: &str,
    ) -> mpsc::UnboundedReceiver<Value> {
        self.subscriptions
            .retain(|key, value| !(key.object == object && value == event_type));

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.handlers.insert(
            HandlerKey {
                event_type: event_type.to_owned(),
                object: object.to_owned(),
            },
            tx,
        );
        let _ = self.subscriptions.insert(
            SubscriptionKey {
                subscription: subscription.to_owned(),
                object: object.to_owned(),
            },
            event_type.to_owned(),
        );
        rx
    }

    /// Deliver an event to its subscriber, if one is registered and still
    /// listening. At-most-once, best-effort: unmatched events are reported
    /// by the caller, never queued.
    pub(crate) fn dispatch(&self, object: &str, event_type: &str, data: Value) -> bool {
        let key = HandlerKey {
            event_type: event_type.to_owned(),
            object: object.to_owned(),
        };
        match self.handlers.get(&key) {
            Some(tx) => {
                if tx.send(data).is_ok() {
                    true
                } else {
                    debug!(event_type, object, "subscriber dropped its event receiver");
                    false
                }
            }
            None => false,
        }
    }

    /// Remove the bookkeeping for a subscription. Returns `true` when the
    /// record existed and both table entries were removed.
    pub(crate) fn remove(&mut self, subscription: &str, object: &str) -> bool {
        let key = SubscriptionKey {
            subscription: subscription.to_owned(),
            object: object.to_owned(),
        };
        match self.subscriptions.remove(&key) {
            Some(event_type) => {
                let _ = self.handlers.remove(&HandlerKey {
                    event_type,
                    object: object.to_owned(),
                });
                true
            }
            None => false,
        }
    }

    /// Drop all handler and subscription state (explicit close, or session
    /// invalidation — subscriptions are meaningless under a new session).
    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
        self.subscriptions.clear();
    }

    #[cfg(test)]
    fn len(&self) -> (usize, usize) {
        (self.handlers.len(), self.subscriptions.len())
    }
}
