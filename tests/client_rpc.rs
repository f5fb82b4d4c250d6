//! End-to-end tests against a scripted in-process WebSocket server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use mediactl::{ClientBuilder, ClientError};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

type ServerWs = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

/// Next request frame, skipping transport-level ping/pong traffic.
async fn recv_request(ws: &mut ServerWs) -> Value {
    loop {
        match ws.next().await.expect("connection closed").unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn create_resolves_value_and_updates_session() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let req = recv_request(&mut ws).await;
        assert_eq!(req["jsonrpc"], "2.0");
        assert_eq!(req["method"], "create");
        assert_eq!(req["params"]["type"], "MediaPipeline");
        send_json(
            &mut ws,
            json!({"id": req["id"], "result": {"value": "pipeline_1", "sessionId": "sess_1"}}),
        )
        .await;
        ws
    });

    let client = ClientBuilder::new(url).connect().await.unwrap();
    let value = client.create("MediaPipeline", json!({})).await.unwrap();
    assert_eq!(value, json!("pipeline_1"));
    assert_eq!(
        client.session_id().await.unwrap().as_deref(),
        Some("sess_1")
    );

    client.close();
    let _ws = server.await.unwrap();
}

#[tokio::test]
async fn responses_resolve_by_id_even_out_of_order() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let first = recv_request(&mut ws).await;
        let second = recv_request(&mut ws).await;
        assert_eq!(first["params"]["operation"], "op_a");
        assert_eq!(second["params"]["operation"], "op_b");
        // Reply in reverse order of arrival.
        send_json(
            &mut ws,
            json!({"id": second["id"], "result": {"value": "result_b"}}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"id": first["id"], "result": {"value": "result_a"}}),
        )
        .await;
        ws
    });

    let client = ClientBuilder::new(url).connect().await.unwrap();
    let (a, b) = tokio::join!(
        client.invoke("ep_1", "op_a", json!({})),
        client.invoke("ep_1", "op_b", json!({})),
    );
    assert_eq!(a.unwrap(), json!("result_a"));
    assert_eq!(b.unwrap(), json!("result_b"));

    client.close();
    let _ws = server.await.unwrap();
}

#[tokio::test]
async fn server_errors_surface_code_message_data() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let req = recv_request(&mut ws).await;
        send_json(
            &mut ws,
            json!({"id": req["id"], "error": {
                "code": 40101,
                "message": "object not found",
                "data": {"object": "no_such"},
            }}),
        )
        .await;
        ws
    });

    let client = ClientBuilder::new(url).connect().await.unwrap();
    let err = client.invoke("no_such", "getStats", json!({})).await.unwrap_err();
    match err {
        ClientError::Server {
            code,
            message,
            data,
        } => {
            assert_eq!(code, 40101);
            assert_eq!(message, "object not found");
            assert_eq!(data.unwrap()["object"], "no_such");
        }
        other => panic!("expected server error, got {other:?}"),
    }

    client.close();
    let _ws = server.await.unwrap();
}

#[tokio::test]
async fn pending_calls_fail_exactly_once_on_disconnect() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let _first = recv_request(&mut ws).await;
        let _second = recv_request(&mut ws).await;
        // Drop the connection with both calls still pending.
        drop(ws);
    });

    let client = ClientBuilder::new(url).connect().await.unwrap();
    let (a, b) = tokio::join!(
        client.invoke("ep_1", "op_a", json!({})),
        client.invoke("ep_1", "op_b", json!({})),
    );
    assert_matches!(a, Err(ClientError::ConnectionInterrupted));
    assert_matches!(b, Err(ClientError::ConnectionInterrupted));

    client.close();
    server.await.unwrap();
}

#[tokio::test]
async fn client_reconnects_and_new_calls_succeed() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        // First connection dies with a call pending.
        let mut ws = accept(&listener).await;
        let _req = recv_request(&mut ws).await;
        drop(ws);
        // Second connection behaves.
        let mut ws = accept(&listener).await;
        let req = recv_request(&mut ws).await;
        assert_eq!(req["method"], "invoke");
        send_json(
            &mut ws,
            json!({"id": req["id"], "result": {"value": "after_reconnect"}}),
        )
        .await;
        ws
    });

    let client = ClientBuilder::new(url).connect().await.unwrap();
    let err = client.invoke("ep_1", "op", json!({})).await.unwrap_err();
    assert_matches!(err, ClientError::ConnectionInterrupted);

    // Pre-reconnect calls are failed, never retried; re-issuing is on us.
    let value = loop {
        match client.invoke("ep_1", "op", json!({})).await {
            Ok(value) => break value,
            Err(ClientError::ConnectionInterrupted) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    };
    assert_eq!(value, json!("after_reconnect"));

    client.close();
    let _ws = server.await.unwrap();
}

#[tokio::test]
async fn subscribe_delivers_matching_events() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let req = recv_request(&mut ws).await;
        assert_eq!(req["method"], "subscribe");
        assert_eq!(req["params"]["type"], "IceCandidateFound");
        assert_eq!(req["params"]["object"], "ep_1");
        send_json(&mut ws, json!({"id": req["id"], "result": {"value": "sub_1"}})).await;
        send_json(
            &mut ws,
            json!({"method": "onEvent", "params": {"value": {
                "object": "ep_1",
                "type": "IceCandidateFound",
                "data": {"candidate": "candidate:1"},
            }}}),
        )
        .await;
        ws
    });

    let client = ClientBuilder::new(url).connect().await.unwrap();
    let mut subscription = client.subscribe("ep_1", "IceCandidateFound").await.unwrap();
    assert_eq!(subscription.id, "sub_1");

    let event = subscription.events.recv().await.unwrap();
    assert_eq!(event["candidate"], "candidate:1");

    client.close();
    let _ws = server.await.unwrap();
}

#[tokio::test]
async fn unsubscribe_is_exactly_once_and_second_attempt_fails() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        // subscribe, then two unsubscribes; the server accepts all three.
        let req = recv_request(&mut ws).await;
        send_json(&mut ws, json!({"id": req["id"], "result": {"value": "sub_1"}})).await;
        for _ in 0..2 {
            let req = recv_request(&mut ws).await;
            assert_eq!(req["method"], "unsubscribe");
            assert_eq!(req["params"]["subscription"], "sub_1");
            send_json(&mut ws, json!({"id": req["id"], "result": {}})).await;
        }
        ws
    });

    let client = ClientBuilder::new(url).connect().await.unwrap();
    let subscription = client.subscribe("ep_1", "Error").await.unwrap();

    client.unsubscribe(&subscription.id, "ep_1").await.unwrap();
    let err = client
        .unsubscribe(&subscription.id, "ep_1")
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::SubscriptionNotFound { .. });

    client.close();
    let _ws = server.await.unwrap();
}

#[tokio::test]
async fn unmatched_event_is_reported_not_fatal() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        send_json(
            &mut ws,
            json!({"method": "onEvent", "params": {"value": {
                "object": "nobody_home",
                "type": "Error",
                "data": {},
            }}}),
        )
        .await;
        let req = recv_request(&mut ws).await;
        assert_eq!(req["method"], "ping");
        send_json(&mut ws, json!({"id": req["id"], "result": {"value": "pong"}})).await;
        ws
    });

    let reports: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let client = ClientBuilder::new(url)
        .reporter(move |line| sink.lock().unwrap().push(line))
        .connect()
        .await
        .unwrap();

    // The client survives the unmatched event and keeps serving calls.
    let value = client.ping(240_000).await.unwrap();
    assert_eq!(value, json!("pong"));
    assert!(
        reports
            .lock()
            .unwrap()
            .iter()
            .any(|line| line.contains("No event handler found"))
    );

    client.close();
    let _ws = server.await.unwrap();
}

#[tokio::test]
async fn session_resume_replays_session_id() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let req = recv_request(&mut ws).await;
        assert_eq!(req["method"], "connect");
        assert_eq!(req["params"]["sessionId"], "sess_9");
        send_json(
            &mut ws,
            json!({"id": req["id"], "result": {"sessionId": "sess_9"}}),
        )
        .await;
        // Subsequent calls keep carrying the session.
        let req = recv_request(&mut ws).await;
        assert_eq!(req["method"], "invoke");
        assert_eq!(req["params"]["sessionId"], "sess_9");
        send_json(&mut ws, json!({"id": req["id"], "result": {"value": true}})).await;
        ws
    });

    let client = ClientBuilder::new(url)
        .session_id("sess_9")
        .connect()
        .await
        .unwrap();
    let value = client.invoke("ep_1", "pause", json!({})).await.unwrap();
    assert_eq!(value, json!(true));

    client.close();
    let _ws = server.await.unwrap();
}

#[tokio::test]
async fn invalid_session_renegotiates_a_fresh_one() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let req = recv_request(&mut ws).await;
        assert_eq!(req["method"], "connect");
        assert_eq!(req["params"]["sessionId"], "stale");
        send_json(
            &mut ws,
            json!({"id": req["id"], "error": {"code": 40007, "message": "Invalid session"}}),
        )
        .await;
        // The retry must not replay the dead session id.
        let req = recv_request(&mut ws).await;
        assert_eq!(req["method"], "connect");
        assert!(req["params"].get("sessionId").is_none());
        send_json(
            &mut ws,
            json!({"id": req["id"], "result": {"sessionId": "fresh"}}),
        )
        .await;
        ws
    });

    let client = ClientBuilder::new(url)
        .session_id("stale")
        .connect()
        .await
        .unwrap();
    assert_eq!(client.session_id().await.unwrap().as_deref(), Some("fresh"));

    client.close();
    let _ws = server.await.unwrap();
}

#[tokio::test]
async fn unanswered_probe_forces_reconnect() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        // Complete the handshake, then go silent: never polling the socket
        // means probes are never answered.
        let (stream, _) = listener.accept().await.unwrap();
        let silent = accept_async(stream).await.unwrap();
        // A second connection attempt proves the dead one was detected.
        let (_stream, _) = listener.accept().await.unwrap();
        drop(silent);
    });

    let client = ClientBuilder::new(url)
        .heartbeat_interval(Duration::from_millis(50))
        .heartbeat_grace(Duration::from_millis(100))
        .connect()
        .await
        .unwrap();

    server.await.unwrap();
    client.close();
}

#[tokio::test]
async fn answered_probes_keep_the_connection_open() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        // Polling the stream answers probes; requests get a canned reply.
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let req: Value = serde_json::from_str(text.as_str()).unwrap();
                send_json(&mut ws, json!({"id": req["id"], "result": {"value": "pong"}})).await;
            }
        }
    });

    let client = ClientBuilder::new(url)
        .heartbeat_interval(Duration::from_millis(50))
        .heartbeat_grace(Duration::from_millis(200))
        .connect()
        .await
        .unwrap();

    // Several probe cycles pass without the connection being declared dead.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let value = client.ping(240_000).await.unwrap();
    assert_eq!(value, json!("pong"));

    client.close();
    server.await.unwrap();
}

#[tokio::test]
async fn close_makes_further_calls_fail() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        // Serve until the client closes.
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let req: Value = serde_json::from_str(text.as_str()).unwrap();
                send_json(&mut ws, json!({"id": req["id"], "result": {"value": 1}})).await;
            }
        }
    });

    let client = ClientBuilder::new(url).connect().await.unwrap();
    let _ = client.ping(240_000).await.unwrap();

    client.close();
    assert!(client.is_closed());

    // The actor winds down; once it is gone every call fails terminally.
    let err = loop {
        match client.ping(240_000).await {
            Err(ClientError::ClientClosed) => break ClientError::ClientClosed,
            Err(ClientError::ConnectionInterrupted) | Ok(_) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    };
    assert_matches!(err, ClientError::ClientClosed);

    server.await.unwrap();
}
