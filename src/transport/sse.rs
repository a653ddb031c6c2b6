use super::codec::{decode_text, encode_request};
use super::pending::RequestTable;
use super::reconnect::ReconnectPolicy;
use super::{
    DEFAULT_REQUEST_TIMEOUT, ToolRequest, ToolResponse, Transport, TransportFuture, TransportKind,
};
use crate::error::TransportError;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

const ENDPOINT_EVENT: &str = "endpoint";
const MESSAGE_EVENT: &str = "message";

/// Accumulates raw stream bytes and hands out complete event blocks.
///
/// Blocks end at the first blank line (`\n\n` or `\r\n\r\n`). Only whole
/// blocks are decoded, so a multibyte character split across chunks survives.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn next_event_block(&mut self) -> Option<String> {
        let end = self.block_end()?;
        let block: Vec<u8> = self.buffer.drain(..end).collect();
        let text = String::from_utf8_lossy(&block);
        if text.contains('\r') {
            Some(text.replace("\r\n", "\n"))
        } else {
            Some(text.into_owned())
        }
    }

    /// Index just past the blank line that terminates the first block.
    fn block_end(&self) -> Option<usize> {
        let bytes = &self.buffer;
        bytes.iter().enumerate().find_map(|(index, byte)| {
            if *byte != b'\n' {
                return None;
            }
            match &bytes[index + 1..] {
                [b'\n', ..] => Some(index + 2),
                [b'\r', b'\n', ..] => Some(index + 3),
                _ => None,
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub name: String,
    pub data: String,
}

/// Parse one event block. Multiple `data` lines are joined with `\n`; the
/// event name defaults to `message`. Comment-only blocks yield `None`.
#[must_use]
pub fn parse_event(event_block: &str) -> Option<SseEvent> {
    let mut name = None;
    let mut data: Vec<&str> = Vec::new();

    for line in event_block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => name = Some(value.trim().to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() && name.is_none() {
        return None;
    }
    Some(SseEvent {
        name: name.unwrap_or_else(|| MESSAGE_EVENT.to_string()),
        data: data.join("\n"),
    })
}

struct SseShared {
    name: String,
    stream_url: Url,
    client: reqwest::Client,
    headers: HashMap<String, String>,
    policy: ReconnectPolicy,
    table: RequestTable,
    connected: AtomicBool,
    endpoint: watch::Sender<Option<Url>>,
}

/// Server-push stream for responses, POST for requests.
///
/// The stream announces the POST target in an `endpoint` event; responses
/// arrive as `message` events. Servers that answer in the POST body are
/// handled too.
pub struct SseTransport {
    shared: Arc<SseShared>,
    timeout: Duration,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SseTransport {
    pub fn new(
        name: impl Into<String>,
        url: &str,
        timeout: Duration,
        policy: ReconnectPolicy,
    ) -> Result<Self, TransportError> {
        let stream_url = Url::parse(url).map_err(|error| {
            TransportError::Connect(format!("invalid stream url '{url}': {error}"))
        })?;
        let (endpoint, _) = watch::channel(None);

        Ok(Self {
            shared: Arc::new(SseShared {
                name: name.into(),
                stream_url,
                client: reqwest::Client::new(),
                headers: HashMap::new(),
                policy,
                table: RequestTable::new(),
                connected: AtomicBool::new(false),
                endpoint,
            }),
            timeout: if timeout.is_zero() {
                DEFAULT_REQUEST_TIMEOUT
            } else {
                timeout
            },
            task: Mutex::new(None),
        })
    }

    /// Extra headers sent with the stream GET and every POST. Must be called
    /// before the transport is shared.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.headers = headers;
        }
        self
    }

    /// The currently announced POST endpoint, if any.
    pub fn endpoint(&self) -> Option<Url> {
        self.shared.endpoint.borrow().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.table.len()
    }

    async fn await_endpoint(&self) -> Result<Url, TransportError> {
        let mut endpoint = self.shared.endpoint.subscribe();
        let announced = async {
            loop {
                if let Some(url) = endpoint.borrow_and_update().clone() {
                    return Ok(url);
                }
                endpoint
                    .changed()
                    .await
                    .map_err(|_| TransportError::ConnectionClosed)?;
            }
        };
        tokio::time::timeout(self.timeout, announced)
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Connect(
                    "no endpoint event received from stream".to_string(),
                ))
            })
    }

    fn take_task(&self) -> Option<(CancellationToken, JoinHandle<()>)> {
        self.task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    async fn stop_task(&self) {
        if let Some((cancel, handle)) = self.take_task() {
            cancel.cancel();
            if let Err(error) = handle.await
                && error.is_panic()
            {
                tracing::warn!(server = %self.shared.name, %error, "event stream task panicked");
            }
        }
    }
}

impl SseShared {
    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        request
    }

    async fn open_stream(&self) -> Result<reqwest::Response, TransportError> {
        let request = self
            .client
            .get(self.stream_url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = self
            .apply_headers(request)
            .send()
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Connect(format!(
                "event stream returned {status}"
            )));
        }
        Ok(response)
    }

    async fn post(&self, endpoint: Url, body: serde_json::Value) -> Result<(), TransportError> {
        let response = self
            .apply_headers(self.client.post(endpoint).json(&body))
            .send()
            .await
            .map_err(|error| TransportError::Send(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Send(format!("POST returned {status}")));
        }

        match response.text().await {
            Ok(text) => {
                if let Some(reply) = decode_text(&text) {
                    self.table.complete(reply);
                }
            }
            Err(error) => {
                tracing::debug!(server = %self.name, %error, "unreadable POST body");
            }
        }
        Ok(())
    }

    fn handle_event(&self, block: &str) {
        let Some(event) = parse_event(block) else {
            return;
        };
        match event.name.as_str() {
            ENDPOINT_EVENT => match self.stream_url.join(event.data.trim()) {
                Ok(url) => {
                    tracing::debug!(server = %self.name, endpoint = %url, "endpoint announced");
                    self.endpoint.send_replace(Some(url));
                }
                Err(error) => {
                    tracing::warn!(server = %self.name, %error, "invalid endpoint event");
                }
            },
            MESSAGE_EVENT => {
                if let Some(reply) = decode_text(&event.data) {
                    self.table.complete(reply);
                }
            }
            other => {
                tracing::debug!(server = %self.name, event = other, "ignoring event");
            }
        }
    }

    /// Read until the stream ends. Returns `true` when stopped by `cancel`.
    async fn pump(&self, response: reqwest::Response, cancel: &CancellationToken) -> bool {
        let mut stream = std::pin::pin!(response.bytes_stream());
        let mut buffer = SseBuffer::new();

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return true,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    buffer.push_chunk(&bytes);
                    while let Some(block) = buffer.next_event_block() {
                        self.handle_event(&block);
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(server = %self.name, %error, "event stream read failed");
                    return false;
                }
                None => {
                    tracing::info!(server = %self.name, "event stream closed by server");
                    return false;
                }
            }
        }
    }

    fn mark_down(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.endpoint.send_replace(None);
        self.table.fail_all(&TransportError::ConnectionClosed);
    }

    async fn reopen(&self, cancel: &CancellationToken) -> Option<reqwest::Response> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            if !self.policy.allows_attempt(attempt) {
                tracing::warn!(
                    server = %self.name,
                    attempts = attempt - 1,
                    "giving up on event stream"
                );
                return None;
            }
            let delay = self.policy.delay_for_attempt(attempt);
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
            match self.open_stream().await {
                Ok(response) => return Some(response),
                Err(error) => {
                    tracing::warn!(
                        server = %self.name,
                        attempt,
                        %error,
                        "event stream reconnect failed"
                    );
                }
            }
        }
    }
}

async fn run_stream(shared: Arc<SseShared>, first: reqwest::Response, cancel: CancellationToken) {
    let mut response = first;
    loop {
        if shared.pump(response, &cancel).await {
            return;
        }
        shared.mark_down();

        let Some(reopened) = shared.reopen(&cancel).await else {
            return;
        };
        shared.connected.store(true, Ordering::SeqCst);
        tracing::info!(server = %shared.name, "event stream reconnected");
        response = reopened;
    }
}

impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn connect(&self) -> TransportFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.is_connected() {
                return Ok(());
            }
            self.stop_task().await;

            let response = self.shared.open_stream().await?;
            self.shared.connected.store(true, Ordering::SeqCst);

            let cancel = CancellationToken::new();
            let handle = tokio::spawn(run_stream(
                Arc::clone(&self.shared),
                response,
                cancel.clone(),
            ));
            *self
                .task
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some((cancel, handle));

            if let Err(error) = self.await_endpoint().await {
                self.disconnect().await;
                return Err(error);
            }
            tracing::info!(
                server = %self.shared.name,
                url = %self.shared.stream_url,
                "sse transport connected"
            );
            Ok(())
        })
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.stop_task().await;
            self.shared.mark_down();
            tracing::info!(server = %self.shared.name, "sse transport disconnected");
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
            if !self.is_connected() {
                return Err(TransportError::NotConnected);
            }
            let endpoint = self.await_endpoint().await?;
            let body = encode_request(&request);
            let shared = Arc::clone(&self.shared);
            self.shared
                .table
                .round_trip(&request.id, self.timeout, async move {
                    shared.post(endpoint, body).await
                })
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_yields_complete_blocks_only() {
        let mut buffer = SseBuffer::new();
        buffer.push_chunk(b"event: endpoint\r\ndata: /post\r\n\r\nevent: mess");
        assert_eq!(
            buffer.next_event_block().as_deref(),
            Some("event: endpoint\ndata: /post\n\n")
        );
        assert!(buffer.next_event_block().is_none());

        buffer.push_chunk(b"age\ndata: {}\n\n");
        assert_eq!(
            buffer.next_event_block().as_deref(),
            Some("event: message\ndata: {}\n\n")
        );
    }

    #[test]
    fn multibyte_character_split_across_chunks_survives() {
        let bytes = "data: {\"v\":\"café\"}\n\n".as_bytes();
        let split = bytes.iter().position(|byte| *byte == 0xC3).unwrap() + 1;

        let mut buffer = SseBuffer::new();
        buffer.push_chunk(&bytes[..split]);
        assert!(buffer.next_event_block().is_none());
        buffer.push_chunk(&bytes[split..]);

        let block = buffer.next_event_block().unwrap();
        assert_eq!(parse_event(&block).unwrap().data, r#"{"v":"café"}"#);
    }

    #[test]
    fn crlf_split_between_chunks_still_ends_the_block() {
        let mut buffer = SseBuffer::new();
        buffer.push_chunk(b"data: 1\r\n\r");
        assert!(buffer.next_event_block().is_none());
        buffer.push_chunk(b"\ndata: 2\n\n");
        assert_eq!(buffer.next_event_block().as_deref(), Some("data: 1\n\n"));
        assert_eq!(buffer.next_event_block().as_deref(), Some("data: 2\n\n"));
    }

    #[test]
    fn parse_event_defaults_and_joins_data() {
        let event = parse_event("data: {\"a\":\ndata:1}\n\n").unwrap();
        assert_eq!(event.name, "message");
        assert_eq!(event.data, "{\"a\":\n1}");

        let endpoint = parse_event("event:endpoint\ndata:/messages?session=9\n\n").unwrap();
        assert_eq!(endpoint.name, "endpoint");
        assert_eq!(endpoint.data, "/messages?session=9");
    }

    #[test]
    fn comment_blocks_are_skipped() {
        assert!(parse_event(": keep-alive\n\n").is_none());
    }

    #[test]
    fn invalid_url_is_rejected_up_front() {
        let result = SseTransport::new(
            "bad",
            "not a url",
            Duration::from_secs(1),
            ReconnectPolicy::default(),
        );
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn unreachable_stream_fails_connect() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = SseTransport::new(
            "down",
            &format!("http://{addr}/sse"),
            Duration::from_secs(1),
            ReconnectPolicy::disabled(),
        )
        .unwrap();
        assert!(matches!(
            transport.connect().await.unwrap_err(),
            TransportError::Connect(_)
        ));
        assert!(!transport.is_connected());
    }
}
