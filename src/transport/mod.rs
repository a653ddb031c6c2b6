//! Uniform request/response contract for tool-execution servers.
//!
//! Three backends share one contract: a local child process speaking
//! newline-delimited JSON over stdio, a remote event stream with POSTed
//! requests, and a remote full-duplex socket. Every backend correlates
//! responses through a [`RequestTable`] keyed by request id.

pub mod codec;
pub mod framing;
pub mod manager;
pub mod pending;
pub mod reconnect;
pub mod sse;
pub mod stdio;
pub mod websocket;

pub use manager::{ServerManager, ToolDescriptor};
pub use pending::RequestTable;
pub use reconnect::ReconnectPolicy;
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One tool-server call. `id` is the correlation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ToolRequest {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Normalised response shared by every backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub id: String,
    pub result: Result<serde_json::Value, RpcError>,
}

impl ToolResponse {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            result: Ok(result),
        }
    }

    pub fn error(id: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Err(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Sse,
    #[serde(rename = "websocket")]
    #[strum(serialize = "websocket")]
    WebSocket,
}

pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn connect(&self) -> TransportFuture<'_, Result<(), TransportError>>;

    /// Close the connection. Every pending request is rejected with
    /// [`TransportError::ConnectionClosed`].
    fn disconnect(&self) -> TransportFuture<'_, ()>;

    fn is_connected(&self) -> bool;

    fn send(
        &self,
        request: ToolRequest,
    ) -> TransportFuture<'_, Result<ToolResponse, TransportError>>;
}
