//! Public client surface: builder and RPC facade.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::connection::{ClientActor, ClientConfig, Command, Reporter};
use crate::error::ClientError;
use crate::registry::Extract;
use crate::router::Subscription;

/// Default liveness probe interval, matching the server-side keepalive.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Default grace period before an unanswered probe closes the connection.
pub const DEFAULT_HEARTBEAT_GRACE: Duration = Duration::from_secs(10);

/// Configures and connects a [`MediaClient`].
pub struct ClientBuilder {
    url: String,
    heartbeat_interval: Duration,
    heartbeat_grace: Duration,
    session_id: Option<String>,
    reporter: Option<Reporter>,
}

impl ClientBuilder {
    /// Start building a client for the given WebSocket URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_grace: DEFAULT_HEARTBEAT_GRACE,
            session_id: None,
            reporter: None,
        }
    }

    /// How often to send liveness probes on the active connection.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// How long an individual probe may go unanswered before the connection
    /// is declared dead and closed.
    #[must_use]
    pub fn heartbeat_grace(mut self, grace: Duration) -> Self {
        self.heartbeat_grace = grace;
        self
    }

    /// Resume a previously established server-side session on first open.
    #[must_use]
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Install a sink for human-readable lifecycle diagnostics (connection
    /// established/closed, reconnecting, dead connection, interrupted
    /// calls). Purely observational.
    #[must_use]
    pub fn reporter(mut self, reporter: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.reporter = Some(Arc::new(reporter));
        self
    }

    /// Spawn the connection actor and resolve once the client is usable:
    /// on the first successful open, after session resume completed if a
    /// session id was preset. Connection failures before that point are
    /// retried with backoff rather than surfaced; wrap in
    /// `tokio::time::timeout` for a bound.
    pub async fn connect(self) -> Result<MediaClient, ClientError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let shutdown = CancellationToken::new();

        let actor = ClientActor::new(
            ClientConfig {
                url: self.url,
                heartbeat_interval: self.heartbeat_interval,
                heartbeat_grace: self.heartbeat_grace,
            },
            cmd_rx,
            shutdown.clone(),
            self.reporter,
            self.session_id,
            ready_tx,
        );
        let _join = tokio::spawn(actor.run());

        ready_rx.await.map_err(|_| ClientError::ClientClosed)?;
        Ok(MediaClient { cmd_tx, shutdown })
    }
}

/// Handle to a connected media server control session.
///
/// Cheap to clone; all clones share one connection and one session.
/// [`close`](Self::close) is terminal for every clone.
#[derive(Clone)]
pub struct MediaClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl MediaClient {
    /// Create a remote object of the given type. Returns the new object's
    /// id (the `value` field of the result).
    pub async fn create(
        &self,
        object_type: &str,
        constructor_params: Value,
    ) -> Result<Value, ClientError> {
        required(object_type, "type")?;
        self.call(
            "create",
            json!({ "type": object_type, "constructorParams": constructor_params }),
            true,
            Extract::Value,
        )
        .await
    }

    /// Invoke an operation on a remote object.
    pub async fn invoke(
        &self,
        object: &str,
        operation: &str,
        operation_params: Value,
    ) -> Result<Value, ClientError> {
        required(object, "object")?;
        required(operation, "operation")?;
        self.call(
            "invoke",
            json!({ "object": object, "operation": operation, "operationParams": operation_params }),
            true,
            Extract::Value,
        )
        .await
    }

    /// Release a remote object and everything it owns.
    pub async fn release(&self, object: &str) -> Result<(), ClientError> {
        required(object, "object")?;
        let _ = self
            .call("release", json!({ "object": object }), true, Extract::Unit)
            .await?;
        Ok(())
    }

    /// Application-level ping, asking the server to expect the next one
    /// within `interval` milliseconds. Does not carry the session id.
    pub async fn ping(&self, interval: u64) -> Result<Value, ClientError> {
        self.call("ping", json!({ "interval": interval }), false, Extract::Value)
            .await
    }

    /// Subscribe to events of `event_type` from a remote object. Events
    /// arrive on the returned [`Subscription`]'s channel; a second subscribe
    /// for the same `(object, type)` pair replaces the first.
    pub async fn subscribe(
        &self,
        object: &str,
        event_type: &str,
    ) -> Result<Subscription, ClientError> {
        required(object, "object")?;
        required(event_type, "type")?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            object: object.to_owned(),
            event_type: event_type.to_owned(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ClientClosed)?
    }

    /// Cancel a subscription. Fails with
    /// [`ClientError::SubscriptionNotFound`] when the subscription is not in
    /// the client's bookkeeping, even if the server accepted the call.
    pub async fn unsubscribe(&self, subscription: &str, object: &str) -> Result<(), ClientError> {
        required(subscription, "subscription")?;
        required(object, "object")?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            subscription: subscription.to_owned(),
            object: object.to_owned(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ClientClosed)?
    }

    /// Current server-assigned session id, if one has been established.
    pub async fn session_id(&self) -> Result<Option<String>, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetSessionId(reply))?;
        rx.await.map_err(|_| ClientError::ClientClosed)
    }

    /// Override the session id replayed on subsequent calls.
    pub fn set_session_id(&self, id: impl Into<String>) -> Result<(), ClientError> {
        self.send(Command::SetSessionId(id.into()))
    }

    /// Close the client. Terminal: the connection is torn down, all pending
    /// calls fail with [`ClientError::ConnectionInterrupted`], and no
    /// reconnect follows. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        with_session: bool,
        extract: Extract,
    ) -> Result<Value, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Call {
            method: method.to_owned(),
            params,
            with_session,
            extract,
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ClientClosed)?
    }

    fn send(&self, cmd: Command) -> Result<(), ClientError> {
        self.cmd_tx.send(cmd).map_err(|_| ClientError::ClientClosed)
    }
}

fn required(value: &str, name: &'static str) -> Result<(), ClientError> {
    if value.is_empty() {
        Err(ClientError::MissingArgument { name })
    } else {
        Ok(())
    }
}
