//! Connection lifecycle actor.
//!
//! One spawned task per client owns the WebSocket, the call registry, the
//! event router, and the session id. Commands from the facade arrive over a
//! channel; all state mutation happens here, never on caller tasks. When the
//! connection drops, every in-flight call is failed (never retried) and the
//! actor reconnects with linear backoff, resuming the server-side session if
//! one was established.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::heartbeat::HeartbeatMonitor;
use crate::protocol::{EventEnvelope, ON_EVENT_METHOD, RpcRequest, RpcResponse, ServerFrame};
use crate::registry::{CallRegistry, CallReply, Extract, PendingCall, PendingKind};
use crate::router::{EventRouter, Subscription};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Optional sink for human-readable lifecycle diagnostics. Observational
/// only; has no control effect.
pub(crate) type Reporter = Arc<dyn Fn(String) + Send + Sync>;

const RECONNECT_STEP: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_millis(10_000);

/// Commands from the facade to the actor.
pub(crate) enum Command {
    Call {
        method: String,
        params: Value,
        with_session: bool,
        extract: Extract,
        reply: CallReply,
    },
    Subscribe {
        object: String,
        event_type: String,
        reply: oneshot::Sender<Result<Subscription, ClientError>>,
    },
    Unsubscribe {
        subscription: String,
        object: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    GetSessionId(oneshot::Sender<Option<String>>),
    SetSessionId(String),
}

/// Why the current connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnOutcome {
    /// Transport failure, server close, or dead-connection detection; the
    /// actor will reconnect.
    Disconnected,
    /// Explicit client close; terminal.
    Closed,
}

/// Linear reconnect backoff: 0, 500, 1000, … ms, applied delay capped at
/// 10 s, reset to zero on every successful open.
pub(crate) struct ReconnectBackoff {
    current: Duration,
}

impl ReconnectBackoff {
    pub(crate) fn new() -> Self {
        Self {
            current: Duration::ZERO,
        }
    }

    /// Delay to apply before the next connection attempt. Grows the counter
    /// as a side effect.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(RECONNECT_CAP);
        self.current += RECONNECT_STEP;
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

/// Connection settings fixed at build time.
pub(crate) struct ClientConfig {
    pub(crate) url: String,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) heartbeat_grace: Duration,
}

pub(crate) struct ClientActor {
    config: ClientConfig,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    reporter: Option<Reporter>,
    registry: CallRegistry,
    router: EventRouter,
    session_id: Option<String>,
    backoff: ReconnectBackoff,
    /// Completed exactly once, on the first usable connection.
    ready: Option<oneshot::Sender<()>>,
}

impl ClientActor {
    pub(crate) fn new(
        config: ClientConfig,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
        reporter: Option<Reporter>,
        session_id: Option<String>,
        ready: oneshot::Sender<()>,
    ) -> Self {
        Self {
            config,
            cmd_rx,
            shutdown,
            reporter,
            registry: CallRegistry::new(),
            router: EventRouter::new(),
            session_id,
            backoff: ReconnectBackoff::new(),
            ready: Some(ready),
        }
    }

    /// Main loop: connect, drive the connection until it ends, invalidate
    /// pending calls, reconnect with backoff. Exits only on explicit close.
    pub(crate) async fn run(mut self) {
        loop {
            let attempt = tokio::select! {
                () = self.shutdown.cancelled() => break,
                attempt = connect_async(self.config.url.as_str()) => attempt,
            };
            match attempt {
                Ok((socket, _response)) => {
                    info!(url = %self.config.url, "connection established");
                    self.report("Connection with media server established.".to_owned());
                    self.backoff.reset();
                    let outcome = self.drive(socket).await;
                    self.invalidate_pending();
                    if outcome == ConnOutcome::Closed {
                        break;
                    }
                    self.report("Connection closed.".to_owned());
                }
                Err(e) => {
                    warn!(error = %e, "connection attempt failed");
                    self.report(format!("Connection failed: {e}."));
                }
            }
            if !self.wait_reconnect().await {
                break;
            }
            self.report("Reconnecting.".to_owned());
        }
        // Terminal: no reconnect will follow, so session-scoped state and
        // anything still in flight is dropped for good.
        self.invalidate_pending();
        self.session_id = None;
        self.router.clear();
    }

    /// Drive one live connection until it ends.
    async fn drive(&mut self, mut socket: WsStream) -> ConnOutcome {
        let mut heartbeat = HeartbeatMonitor::new(self.config.heartbeat_grace);
        let mut probe_ticker = time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );

        if let Some(sid) = self.session_id.clone() {
            let params = json!({ "sessionId": sid });
            if let Some(outcome) = self
                .send_call(&mut socket, "connect", params, PendingKind::SessionResume)
                .await
            {
                return outcome;
            }
        } else {
            self.notify_ready();
        }

        loop {
            let probe_deadline = heartbeat.next_deadline();
            let outcome = tokio::select! {
                () = self.shutdown.cancelled() => {
                    let _ = socket.close(None).await;
                    Some(ConnOutcome::Closed)
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(&mut socket, cmd).await,
                    None => {
                        let _ = socket.close(None).await;
                        Some(ConnOutcome::Closed)
                    }
                },
                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_frame(&mut socket, text.as_str()).await
                    }
                    Some(Ok(Message::Pong(payload))) => {
                        if !heartbeat.ack(&payload) {
                            debug!("pong did not match an outstanding probe");
                        }
                        None
                    }
                    Some(Ok(Message::Close(_))) | None => Some(ConnOutcome::Disconnected),
                    // Binary frames are not part of the control protocol;
                    // pings are answered by the transport layer.
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket error");
                        self.report("Websocket error.".to_owned());
                        Some(ConnOutcome::Disconnected)
                    }
                },
                _ = probe_ticker.tick() => {
                    let seq = heartbeat.begin_probe(Instant::now());
                    let payload = HeartbeatMonitor::probe_payload(seq);
                    match socket.send(Message::Ping(payload.into())).await {
                        Ok(()) => None,
                        Err(e) => {
                            warn!(error = %e, seq, "liveness probe send failed");
                            Some(ConnOutcome::Disconnected)
                        }
                    }
                }
                () = time::sleep_until(probe_deadline.unwrap_or_else(Instant::now)),
                        if probe_deadline.is_some() => {
                    match heartbeat.take_expired(Instant::now()) {
                        Some(seq) => {
                            warn!(seq, "liveness probe unanswered, closing connection");
                            self.report(format!("Closing dead connection. {seq}"));
                            let _ = socket.close(None).await;
                            Some(ConnOutcome::Disconnected)
                        }
                        None => None,
                    }
                }
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    async fn handle_command(&mut self, socket: &mut WsStream, cmd: Command) -> Option<ConnOutcome> {
        match cmd {
            Command::Call {
                method,
                mut params,
                with_session,
                extract,
                reply,
            } => {
                if with_session {
                    self.inject_session(&mut params);
                }
                self.send_call(socket, &method, params, PendingKind::Call { reply, extract })
                    .await
            }
            Command::Subscribe {
                object,
                event_type,
                reply,
            } => {
                let mut params = json!({ "type": &event_type, "object": &object });
                self.inject_session(&mut params);
                self.send_call(
                    socket,
                    "subscribe",
                    params,
                    PendingKind::Subscribe {
                        object,
                        event_type,
                        reply,
                    },
                )
                .await
            }
            Command::Unsubscribe {
                subscription,
                object,
                reply,
            } => {
                let mut params = json!({ "subscription": &subscription, "object": &object });
                self.inject_session(&mut params);
                self.send_call(
                    socket,
                    "unsubscribe",
                    params,
                    PendingKind::Unsubscribe {
                        subscription,
                        object,
                        reply,
                    },
                )
                .await
            }
            Command::GetSessionId(reply) => {
                let _ = reply.send(self.session_id.clone());
                None
            }
            Command::SetSessionId(sid) => {
                self.session_id = Some(sid);
                None
            }
        }
    }

    /// Serialize and send one request. On a synchronous send failure the
    /// caller is failed immediately and no registry entry is created.
    async fn send_call(
        &mut self,
        socket: &mut WsStream,
        method: &str,
        params: Value,
        kind: PendingKind,
    ) -> Option<ConnOutcome> {
        let id = self.registry.allocate_id();
        let request = RpcRequest::new(id, method, params.clone());
        let text = match serde_json::to_string(&request) {
            Ok(text) => text,
            Err(e) => {
                fail_kind(
                    kind,
                    ClientError::Transport {
                        message: e.to_string(),
                    },
                );
                return None;
            }
        };
        debug!(id, method, "sending call");
        match socket.send(Message::Text(text.into())).await {
            Ok(()) => {
                self.registry.register(
                    id,
                    PendingCall {
                        method: method.to_owned(),
                        params,
                        kind,
                    },
                );
                None
            }
            Err(e) => {
                warn!(id, method, error = %e, "send failed");
                fail_kind(
                    kind,
                    ClientError::Transport {
                        message: e.to_string(),
                    },
                );
                Some(ConnOutcome::Disconnected)
            }
        }
    }

    async fn handle_frame(&mut self, socket: &mut WsStream, text: &str) -> Option<ConnOutcome> {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(ServerFrame::Response(response)) => self.handle_response(socket, response).await,
            Ok(ServerFrame::Notification(notification)) => {
                if notification.method == ON_EVENT_METHOD {
                    self.handle_event(notification.params);
                } else {
                    debug!(method = notification.method, "unrecognized notification");
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "discarding unparseable frame");
                None
            }
        }
    }

    fn handle_event(&mut self, params: Value) {
        let envelope: EventEnvelope = match serde_json::from_value(params) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "malformed onEvent notification");
                return;
            }
        };
        let event = envelope.value;
        if !self
            .router
            .dispatch(&event.object, &event.event_type, event.data)
        {
            debug!(
                event_type = event.event_type,
                object = event.object,
                "no event handler registered"
            );
            self.report(format!(
                "No event handler found for \"{}\" @ \"{}\".",
                event.event_type, event.object
            ));
        }
    }

    async fn handle_response(
        &mut self,
        socket: &mut WsStream,
        response: RpcResponse,
    ) -> Option<ConnOutcome> {
        let Some(pending) = self.registry.complete(response.id) else {
            // Late response for a call already invalidated by a close.
            debug!(id = response.id, "response for unknown call id");
            return None;
        };

        let outcome = match response.error {
            Some(body) => Err(ClientError::from_error_body(body)),
            None => {
                let result = response.result.unwrap_or(Value::Null);
                // Any result carrying a sessionId keeps the session fresh.
                if let Some(sid) = result.get("sessionId").and_then(Value::as_str) {
                    self.session_id = Some(sid.to_owned());
                }
                Ok(result)
            }
        };

        match pending.kind {
            PendingKind::Call { reply, extract } => {
                let _ = reply.send(outcome.map(|result| extract.apply(result)));
                None
            }
            PendingKind::Subscribe {
                object,
                event_type,
                reply,
            } => {
                match outcome {
                    Ok(result) => {
                        let value = Extract::Value.apply(result);
                        // The subscription id is opaque; stringify non-string
                        // server values rather than reject them.
                        let id = value
                            .as_str()
                            .map_or_else(|| value.to_string(), ToOwned::to_owned);
                        let events = self.router.register(&object, &event_type, &id);
                        let _ = reply.send(Ok(Subscription { id, events }));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                None
            }
            PendingKind::Unsubscribe {
                subscription,
                object,
                reply,
            } => {
                match outcome {
                    Ok(_) => {
                        if self.router.remove(&subscription, &object) {
                            let _ = reply.send(Ok(()));
                        } else {
                            self.report(format!(
                                "Subscription not found for \"{subscription}\" on \"{object}\"."
                            ));
                            let _ = reply.send(Err(ClientError::SubscriptionNotFound {
                                subscription,
                                object,
                            }));
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                None
            }
            PendingKind::SessionResume => match outcome {
                Ok(_) => {
                    info!("session resumed");
                    self.notify_ready();
                    None
                }
                Err(e) if e.is_invalid_session() => {
                    self.report("Invalid media server session.".to_owned());
                    // Session-scoped bookkeeping is meaningless under a new
                    // session; the caller must re-subscribe.
                    self.session_id = None;
                    self.router.clear();
                    self.send_call(socket, "connect", json!({}), PendingKind::SessionFresh)
                        .await
                }
                Err(e) => {
                    self.report(format!("Error validating media server session: {e}"));
                    Some(ConnOutcome::Disconnected)
                }
            },
            PendingKind::SessionFresh => match outcome {
                Ok(_) => {
                    info!("new session established");
                    self.notify_ready();
                    None
                }
                Err(e) => {
                    self.report(format!("Error creating new media server session: {e}"));
                    Some(ConnOutcome::Disconnected)
                }
            },
        }
    }

    /// Fail every pending call with a connection-interrupted error and clear
    /// the registry. Delivery is via oneshot completion, so nothing runs
    /// re-entrantly inside the close path.
    fn invalidate_pending(&mut self) {
        for call in self.registry.drain() {
            self.report(format!(
                "Clearing interrupted call: {} {}",
                call.method, call.params
            ));
            fail_kind(call.kind, ClientError::ConnectionInterrupted);
        }
    }

    /// Wait out the backoff delay before the next connection attempt,
    /// failing any calls issued meanwhile. Returns `false` when the client
    /// was closed during the wait.
    async fn wait_reconnect(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "reconnect scheduled");
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return false,
                () = time::sleep_until(deadline) => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.fail_offline_command(cmd),
                    None => return false,
                },
            }
        }
    }

    /// There is no live connection; calls fail fast instead of queueing.
    fn fail_offline_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call { reply, .. } => {
                let _ = reply.send(Err(ClientError::ConnectionInterrupted));
            }
            Command::Subscribe { reply, .. } => {
                let _ = reply.send(Err(ClientError::ConnectionInterrupted));
            }
            Command::Unsubscribe { reply, .. } => {
                let _ = reply.send(Err(ClientError::ConnectionInterrupted));
            }
            Command::GetSessionId(reply) => {
                let _ = reply.send(self.session_id.clone());
            }
            Command::SetSessionId(sid) => {
                self.session_id = Some(sid);
            }
        }
    }

    fn inject_session(&self, params: &mut Value) {
        if let (Some(sid), Some(object)) = (&self.session_id, params.as_object_mut()) {
            let _ = object.insert("sessionId".to_owned(), Value::String(sid.clone()));
        }
    }

    fn notify_ready(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
    }

    fn report(&self, message: String) {
        if let Some(reporter) = &self.reporter {
            reporter(message);
        }
    }
}

fn fail_kind(kind: PendingKind, error: ClientError) {
    match kind {
        PendingKind::Call { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        PendingKind::Subscribe { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        PendingKind::Unsubscribe { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        // Internal session negotiation has no caller to notify.
        PendingKind::SessionResume | PendingKind::SessionFresh => {}
    }
}
