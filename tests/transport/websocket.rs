use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use harbor_kernel::error::TransportError;
use harbor_kernel::transport::{ReconnectPolicy, ToolRequest, Transport, WebSocketTransport};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use super::eventually;

const BATCH: usize = 3;

/// Echo server. `batch` requests are held until three arrive, then answered
/// in reverse order after a stray reply for an unknown id. `close` drops the
/// socket without replying and `hang` is never answered.
async fn serve_socket(stream: TcpStream) {
    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = socket.split();
    let mut held: Vec<Value> = Vec::new();

    while let Some(Ok(message)) = read.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let request: Value = serde_json::from_str(&text).unwrap();
        match request["method"].as_str() {
            Some("hang") => {}
            Some("close") => {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            Some("batch") => {
                held.push(request);
                if held.len() == BATCH {
                    let stray = json!({"jsonrpc": "2.0", "id": "nobody", "result": 0});
                    let _ = write.send(Message::Text(stray.to_string().into())).await;
                    for request in held.drain(..).rev() {
                        let reply = json!({
                            "jsonrpc": "2.0",
                            "id": request["id"],
                            "result": request["params"],
                        });
                        let _ = write.send(Message::Text(reply.to_string().into())).await;
                    }
                }
            }
            _ => {
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": {"echo": request["params"]},
                });
                let _ = write.send(Message::Binary(reply.to_string().into_bytes().into())).await;
            }
        }
    }
}

async fn spawn_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let accepted = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_socket(stream));
        }
    });
    (addr, connections)
}

async fn connected(addr: SocketAddr, timeout: Duration) -> Arc<WebSocketTransport> {
    let transport = WebSocketTransport::new(
        "socket",
        format!("ws://{addr}/"),
        timeout,
        ReconnectPolicy {
            auto_reconnect: true,
            base_delay_ms: 10,
            max_delay_ms: 50,
            max_attempts: 20,
        },
    );
    transport.connect().await.unwrap();
    Arc::new(transport)
}

#[tokio::test]
async fn reverse_order_replies_reach_their_callers() {
    let (addr, _connections) = spawn_server().await;
    let transport = connected(addr, Duration::from_secs(2)).await;

    let callers: Vec<_> = (0..BATCH)
        .map(|index| {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport
                    .send(ToolRequest::new(format!("b{index}"), "batch", json!(index)))
                    .await
            })
        })
        .collect();

    for (index, caller) in callers.into_iter().enumerate() {
        let response = caller.await.unwrap().unwrap();
        assert_eq!(response.id, format!("b{index}"));
        assert_eq!(response.result, Ok(json!(index)));
    }
    assert_eq!(transport.pending_count(), 0);
}

#[tokio::test]
async fn binary_frames_are_accepted() {
    let (addr, _connections) = spawn_server().await;
    let transport = connected(addr, Duration::from_secs(2)).await;

    let response = transport
        .send(ToolRequest::new("e", "echo", json!({"x": 1})))
        .await
        .unwrap();
    assert_eq!(response.result, Ok(json!({"echo": {"x": 1}})));
}

#[tokio::test]
async fn timeout_evicts_request() {
    let (addr, _connections) = spawn_server().await;
    let transport = connected(addr, Duration::from_millis(100)).await;

    let err = transport
        .send(ToolRequest::new("h", "hang", Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }));
    assert_eq!(transport.pending_count(), 0);
    assert!(transport.is_connected());
}

#[tokio::test]
async fn server_close_fails_pending_then_reconnects() {
    let (addr, connections) = spawn_server().await;
    let transport = connected(addr, Duration::from_secs(5)).await;

    let err = transport
        .send(ToolRequest::new("c", "close", Value::Null))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::ConnectionClosed);

    assert!(eventually(|| connections.load(Ordering::SeqCst) == 2).await);
    assert!(eventually(|| transport.is_connected()).await);

    let response = transport
        .send(ToolRequest::new("again", "echo", json!("ok")))
        .await
        .unwrap();
    assert_eq!(response.result, Ok(json!({"echo": "ok"})));
}

#[tokio::test]
async fn disconnect_rejects_pending() {
    let (addr, connections) = spawn_server().await;
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

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn refused_connection_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = WebSocketTransport::new(
        "down",
        format!("ws://{addr}/"),
        Duration::from_secs(1),
        ReconnectPolicy::disabled(),
    );
    assert!(matches!(
        transport.connect().await.unwrap_err(),
        TransportError::Connect(_)
    ));
}
