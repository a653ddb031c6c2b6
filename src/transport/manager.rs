use super::sse::SseTransport;
use super::stdio::{StdioCommand, StdioTransport};
use super::websocket::WebSocketTransport;
use super::{ToolRequest, Transport, TransportKind};
use crate::config::{KernelConfig, ServerConfig, ServerTransport, TransportConfig};
use crate::error::{KernelError, Result, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A tool advertised by a server's `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// Named tool servers addressed uniformly regardless of backend.
pub struct ServerManager {
    servers: RwLock<HashMap<String, Arc<dyn Transport>>>,
    next_id: AtomicU64,
}

impl Default for ServerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build (but do not connect) a transport for every enabled server.
    #[must_use]
    pub fn from_config(config: &KernelConfig) -> Self {
        let manager = Self::new();
        for server in config.enabled_servers() {
            if server.max_call_seconds == 0 {
                tracing::warn!(
                    server = %server.name,
                    "Skipping server with invalid max_call_seconds=0"
                );
                continue;
            }
            match build_transport(server, &config.transport) {
                Ok(transport) => manager.add_server(&server.name, transport),
                Err(error) => {
                    tracing::warn!(server = %server.name, error = %error, "Skipping server");
                }
            }
        }
        manager
    }

    pub fn add_server(&self, name: &str, transport: Arc<dyn Transport>) {
        let previous = self
            .servers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.to_string(), transport);
        if previous.is_some() {
            tracing::warn!(server = %name, "replaced existing server registration");
        }
    }

    pub async fn remove_server(&self, name: &str) -> bool {
        let removed = self
            .servers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name);
        match removed {
            Some(transport) => {
                transport.disconnect().await;
                true
            }
            None => false,
        }
    }

    fn transport(&self, name: &str) -> std::result::Result<Arc<dyn Transport>, TransportError> {
        self.servers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::UnknownServer(name.to_string()))
    }

    #[must_use]
    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .servers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn is_connected(&self, name: &str) -> bool {
        self.transport(name)
            .is_ok_and(|transport| transport.is_connected())
    }

    #[must_use]
    pub fn kind(&self, name: &str) -> Option<TransportKind> {
        self.transport(name).ok().map(|transport| transport.kind())
    }

    pub async fn connect(&self, name: &str) -> Result<()> {
        let transport = self.transport(name)?;
        transport.connect().await?;
        Ok(())
    }

    /// Connect every registered server. Failures are logged and returned;
    /// the remaining servers are still attempted.
    pub async fn connect_all(&self) -> Vec<(String, TransportError)> {
        let mut failures = Vec::new();
        for name in self.server_ids() {
            let Ok(transport) = self.transport(&name) else {
                continue;
            };
            if let Err(error) = transport.connect().await {
                tracing::warn!(server = %name, error = %error, "Failed to connect server");
                failures.push((name, error));
            }
        }
        failures
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let transport = self.transport(name)?;
        transport.disconnect().await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let transports: Vec<Arc<dyn Transport>> = self
            .servers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for transport in transports {
            transport.disconnect().await;
        }
    }

    /// Send one request, connecting first if the server is down. RPC-level
    /// errors become [`KernelError::ToolFailed`].
    pub async fn request(&self, server: &str, method: &str, params: Value) -> Result<Value> {
        let transport = self.transport(server)?;
        if !transport.is_connected() {
            transport.connect().await?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let response = transport
            .send(ToolRequest::new(id, method, params))
            .await?;

        response.result.map_err(|error| KernelError::ToolFailed {
            server: server.to_string(),
            method: method.to_string(),
            message: error.message,
        })
    }

    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>> {
        let result = self.request(server, "tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(tools).map_err(|error| {
            KernelError::Transport(TransportError::Protocol(format!(
                "malformed tools/list from '{server}': {error}"
            )))
        })
    }

    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> Result<Value> {
        let arguments = match arguments {
            Value::Null => json!({}),
            Value::Object(_) => arguments,
            _ => {
                return Err(KernelError::InvalidRequest(format!(
                    "tool '{tool}' requires JSON object arguments"
                )));
            }
        };

        let result = self
            .request(
                server,
                "tools/call",
                json!({ "name": tool, "arguments": arguments }),
            )
            .await?;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(KernelError::ToolFailed {
                server: server.to_string(),
                method: tool.to_string(),
                message: content_text(&result).unwrap_or_else(|| "tool reported an error".into()),
            });
        }
        Ok(result)
    }
}

fn content_text(result: &Value) -> Option<String> {
    let parts: Vec<&str> = result
        .get("content")?
        .as_array()?
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}

pub fn build_transport(
    server: &ServerConfig,
    defaults: &TransportConfig,
) -> std::result::Result<Arc<dyn Transport>, TransportError> {
    let timeout = Duration::from_secs(if server.max_call_seconds > 0 {
        server.max_call_seconds
    } else {
        defaults.request_timeout_secs
    });

    let transport: Arc<dyn Transport> = match &server.transport {
        ServerTransport::Stdio { command, args, env } => {
            if command.is_empty() {
                return Err(TransportError::Process(
                    "stdio transport requires a command".to_string(),
                ));
            }
            Arc::new(StdioTransport::new(
                &server.name,
                StdioCommand {
                    command: shellexpand::tilde(command).into_owned(),
                    args: args.clone(),
                    env: env.clone(),
                },
                timeout,
            ))
        }
        ServerTransport::Sse { url, headers } => Arc::new(
            SseTransport::new(&server.name, url, timeout, defaults.reconnect.clone())?
                .with_headers(headers.clone()),
        ),
        ServerTransport::WebSocket { url } => Arc::new(WebSocketTransport::new(
            &server.name,
            url,
            timeout,
            defaults.reconnect.clone(),
        )),
    };
    Ok(transport)
}
