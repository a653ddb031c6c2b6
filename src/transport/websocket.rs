use super::codec::{decode_text, encode_line};
use super::pending::RequestTable;
use super::reconnect::ReconnectPolicy;
use super::{
    DEFAULT_REQUEST_TIMEOUT, ToolRequest, ToolResponse, Transport, TransportFuture, TransportKind,
};
use crate::error::TransportError;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_QUEUE: usize = 64;

struct WsShared {
    name: String,
    url: String,
    policy: ReconnectPolicy,
    table: RequestTable,
    connected: AtomicBool,
}

/// Requests and responses as text frames over one full-duplex socket.
pub struct WebSocketTransport {
    shared: Arc<WsShared>,
    timeout: Duration,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl WebSocketTransport {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(WsShared {
                name: name.into(),
                url: url.into(),
                policy,
                table: RequestTable::new(),
                connected: AtomicBool::new(false),
            }),
            timeout: if timeout.is_zero() {
                DEFAULT_REQUEST_TIMEOUT
            } else {
                timeout
            },
            outbound: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.table.len()
    }

    fn outbound(&self) -> Result<mpsc::Sender<String>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    async fn stop_task(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if let Err(error) = handle.await
                && error.is_panic()
            {
                tracing::warn!(server = %self.shared.name, %error, "socket task panicked");
            }
        }
    }
}

impl WsShared {
    async fn open(&self) -> Result<Socket, TransportError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|error| TransportError::Connect(format!("{}: {error}", self.url)))?;
        Ok(socket)
    }

    /// Drive one socket until it closes. Returns `true` when the transport
    /// asked to stop.
    async fn pump(
        &self,
        socket: Socket,
        outbound: &mut mpsc::Receiver<String>,
        cancel: &CancellationToken,
    ) -> bool {
        let (mut write, mut read) = socket.split();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    if let Err(error) = write.send(Message::Close(None)).await {
                        tracing::debug!(server = %self.name, %error, "close frame not sent");
                    }
                    return true;
                }
                outgoing = outbound.recv() => {
                    let Some(text) = outgoing else {
                        return true;
                    };
                    if let Err(error) = write.send(Message::Text(text.into())).await {
                        tracing::warn!(server = %self.name, %error, "socket write failed");
                        return false;
                    }
                }
                incoming = read.next() => {
                    let message = match incoming {
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!(server = %self.name, "socket closed by server");
                            return false;
                        }
                        Some(Err(error)) => {
                            tracing::warn!(server = %self.name, %error, "socket read failed");
                            return false;
                        }
                        Some(Ok(message)) => message,
                    };
                    if let Some(text) = websocket_message_to_text(message)
                        && let Some(reply) = decode_text(&text)
                    {
                        self.table.complete(reply);
                    }
                }
            }
        }
    }

    fn mark_down(&self, outbound: &mut mpsc::Receiver<String>) {
        self.connected.store(false, Ordering::SeqCst);
        while outbound.try_recv().is_ok() {}
        self.table.fail_all(&TransportError::ConnectionClosed);
    }

    async fn reopen(&self, cancel: &CancellationToken) -> Option<Socket> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            if !self.policy.allows_attempt(attempt) {
                tracing::warn!(server = %self.name, attempts = attempt - 1, "giving up on socket");
                return None;
            }
            let delay = self.policy.delay_for_attempt(attempt);
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
            match self.open().await {
                Ok(socket) => return Some(socket),
                Err(error) => {
                    tracing::warn!(server = %self.name, attempt, %error, "socket reconnect failed");
                }
            }
        }
    }
}

async fn run_socket(
    shared: Arc<WsShared>,
    first: Socket,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let mut socket = first;
    loop {
        let stopped = shared.pump(socket, &mut outbound, &cancel).await;
        shared.mark_down(&mut outbound);
        if stopped {
            return;
        }

        let Some(reopened) = shared.reopen(&cancel).await else {
            return;
        };
        shared.connected.store(true, Ordering::SeqCst);
        tracing::info!(server = %shared.name, "socket reconnected");
        socket = reopened;
    }
}

pub fn websocket_message_to_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text.to_string()),
        Message::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok(),
        _ => None,
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn connect(&self) -> TransportFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.is_connected() {
                return Ok(());
            }
            self.stop_task().await;

            let socket = self.shared.open().await?;
            let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
            let cancel = CancellationToken::new();

            self.shared.connected.store(true, Ordering::SeqCst);
            let handle = tokio::spawn(run_socket(
                Arc::clone(&self.shared),
                socket,
                outbound_rx,
                cancel.clone(),
            ));
            *self
                .outbound
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(outbound);
            *self
                .task
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some((cancel, handle));

            tracing::info!(
                server = %self.shared.name,
                url = %self.shared.url,
                "socket transport connected"
            );
            Ok(())
        })
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.stop_task().await;
            self.shared.connected.store(false, Ordering::SeqCst);
            self.shared.table.fail_all(&TransportError::ConnectionClosed);
            tracing::info!(server = %self.shared.name, "socket transport disconnected");
        })
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn send(
        &self,
        request: ToolRequest,
    ) -> TransportFuture<'_, Result<ToolResponse, TransportError>> {
        Box::pin(async move {
            let outbound = self.outbound()?;
            let frame = encode_line(&request);
            self.shared
                .table
                .round_trip(&request.id, self.timeout, async move {
                    outbound
                        .send(frame)
                        .await
                        .map_err(|_| TransportError::Send("socket writer closed".to_string()))
                })
                .await
        })
    }
}
