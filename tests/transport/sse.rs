use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use harbor_kernel::error::TransportError;
use harbor_kernel::transport::{ReconnectPolicy, SseTransport, ToolRequest, Transport};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::eventually;

#[derive(Clone, Default)]
struct ServerState {
    stream: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    connections: Arc<AtomicUsize>,
}

impl ServerState {
    fn drop_stream(&self) {
        self.stream.lock().unwrap().take();
    }
}

async fn open_stream(State(state): State<ServerState>) -> Response {
    let session = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let (tx, rx) = mpsc::channel::<String>(32);
    tx.send(format!(": welcome\n\nevent: endpoint\ndata: /messages?session={session}\n\n"))
        .await
        .unwrap();
    *state.stream.lock().unwrap() = Some(tx);

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    axum::http::Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .unwrap()
}

async fn handle_post(State(state): State<ServerState>, Json(request): Json<Value>) -> Response {
    let method = request["method"].as_str().unwrap_or_default().to_string();
    let reply = json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "result": {"echo": request["params"]},
    });

    match method.as_str() {
        "hang" => StatusCode::ACCEPTED.into_response(),
        "inline" => Json(reply).into_response(),
        "reject" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        _ => {
            let stream = state.stream.lock().unwrap().clone();
            if let Some(stream) = stream {
                // One event split across two body chunks.
                let event = format!("event: message\ndata: {reply}\n\n");
                let (head, tail) = event.split_at(event.len() / 2);
                let _ = stream.send(head.to_string()).await;
                let _ = stream.send(tail.to_string()).await;
            }
            StatusCode::ACCEPTED.into_response()
        }
    }
}

async fn spawn_server() -> (SocketAddr, ServerState) {
    let state = ServerState::default();
    let app = Router::new()
        .route("/sse", get(open_stream))
        .route("/messages", post(handle_post))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        auto_reconnect: true,
        base_delay_ms: 10,
        max_delay_ms: 50,
        max_attempts: 20,
    }
}

async fn connected(addr: SocketAddr, timeout: Duration) -> Arc<SseTransport> {
    let transport = SseTransport::new(
        "events",
        &format!("http://{addr}/sse"),
        timeout,
        fast_reconnect(),
    )
    .unwrap();
    transport.connect().await.unwrap();
    Arc::new(transport)
}

#[tokio::test]
async fn endpoint_event_is_resolved_against_stream_url() {
    let (addr, _state) = spawn_server().await;
    let transport = connected(addr, Duration::from_secs(2)).await;

    let endpoint = transport.endpoint().unwrap();
    assert_eq!(endpoint.path(), "/messages");
    assert_eq!(endpoint.query(), Some("session=1"));
    assert_eq!(endpoint.port(), Some(addr.port()));
}

#[tokio::test]
async fn responses_arrive_over_stream_or_post_body() {
    let (addr, _state) = spawn_server().await;
    let transport = connected(addr, Duration::from_secs(2)).await;

    let streamed = transport
        .send(ToolRequest::new("1", "echo", json!({"q": "stream"})))
        .await
        .unwrap();
    assert_eq!(streamed.result, Ok(json!({"echo": {"q": "stream"}})));

    let inline = transport
        .send(ToolRequest::new("2", "inline", json!({"q": "body"})))
        .await
        .unwrap();
    assert_eq!(inline.result, Ok(json!({"echo": {"q": "body"}})));
}

#[tokio::test]
async fn concurrent_requests_match_by_id() {
    let (addr, _state) = spawn_server().await;
    let transport = connected(addr, Duration::from_secs(2)).await;

    let callers: Vec<_> = (0..8)
        .map(|index| {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .send(ToolRequest::new(format!("c{index}"), "echo", json!(index)))
                    .await
            })
        })
        .collect();

    for (index, caller) in callers.into_iter().enumerate() {
        let response = caller.await.unwrap().unwrap();
        assert_eq!(response.id, format!("c{index}"));
        assert_eq!(response.result, Ok(json!({"echo": index})));
    }
    assert_eq!(transport.pending_count(), 0);
}

#[tokio::test]
async fn unanswered_request_times_out_and_is_evicted() {
    let (addr, _state) = spawn_server().await;
    let transport = connected(addr, Duration::from_millis(150)).await;

    let err = transport
        .send(ToolRequest::new("h", "hang", Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }));
    assert_eq!(transport.pending_count(), 0);
}

#[tokio::test]
async fn failed_post_is_a_send_error() {
    let (addr, _state) = spawn_server().await;
    let transport = connected(addr, Duration::from_secs(2)).await;

    let err = transport
        .send(ToolRequest::new("r", "reject", Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Send(ref message) if message.contains("500")));
    assert_eq!(transport.pending_count(), 0);
}

#[tokio::test]
async fn dropped_stream_fails_pending_then_reconnects() {
    let (addr, state) = spawn_server().await;
    let transport = connected(addr, Duration::from_secs(5)).await;

    let waiting = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            transport
                .send(ToolRequest::new("w", "hang", Value::Null))
                .await
        })
    };
    assert!(eventually(|| transport.pending_count() == 1).await);

    state.drop_stream();
    assert_eq!(
        waiting.await.unwrap().unwrap_err(),
        TransportError::ConnectionClosed
    );

    assert!(eventually(|| state.connections.load(Ordering::SeqCst) == 2).await);
    assert!(
        eventually(|| transport
            .endpoint()
            .is_some_and(|url| url.query() == Some("session=2")))
        .await
    );

    let response = transport
        .send(ToolRequest::new("after", "echo", json!("again")))
        .await
        .unwrap();
    assert_eq!(response.result, Ok(json!({"echo": "again"})));
}

#[tokio::test]
async fn disconnect_rejects_pending_and_stops_reconnecting() {
    let (addr, state) = spawn_server().await;
    let transport = connected(addr, Duration::from_secs(5)).await;

    let waiting = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            transport
                .send(ToolRequest::new("w", "hang", Value::Null))
                .await
        })
    };
    assert!(eventually(|| transport.pending_count() == 1).await);

    transport.disconnect().await;
    assert_eq!(
        waiting.await.unwrap().unwrap_err(),
        TransportError::ConnectionClosed
    );
    assert!(!transport.is_connected());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.connections.load(Ordering::SeqCst), 1);
    assert_eq!(
        transport
            .send(ToolRequest::new("late", "echo", Value::Null))
            .await
            .unwrap_err(),
        TransportError::NotConnected
    );
}
