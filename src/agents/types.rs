use crate::error::{ErrorCode, KernelError, Result};
use crate::permissions::Scope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentKind {
    Local,
    /// Reached over the remote agent HTTP contract at `endpoint`.
    Remote { endpoint: String },
}

impl AgentKind {
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::Local => None,
            Self::Remote { endpoint } => Some(endpoint),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Suspended,
    Terminated,
}

/// Monotonic per-agent counters. Reset only by unregistering the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub prompt_count: u64,
    pub tool_call_count: u64,
    pub messages_sent: u64,
    pub invocations_made: u64,
    pub invocations_received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    Prompt,
    ToolCall,
    MessageSent,
    InvocationMade,
    InvocationReceived,
}

impl AgentUsage {
    pub fn bump(&mut self, kind: UsageKind) {
        let counter = match kind {
            UsageKind::Prompt => &mut self.prompt_count,
            UsageKind::ToolCall => &mut self.tool_call_count,
            UsageKind::MessageSent => &mut self.messages_sent,
            UsageKind::InvocationMade => &mut self.invocations_made,
            UsageKind::InvocationReceived => &mut self.invocations_received,
        };
        *counter = counter.saturating_add(1);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub kind: AgentKind,
    pub status: AgentStatus,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_ctx: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub accepts_invocations: bool,
    pub accepts_messages: bool,
    pub registered_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub usage: AgentUsage,
}

/// What a caller declares about the agent it registers. Also the body of a
/// remote agent's `GET /agent-info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOptions {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub accepts_invocations: bool,
    #[serde(default = "default_true")]
    pub accepts_messages: bool,
}

fn default_true() -> bool {
    true
}

impl AgentOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            capabilities: Vec::new(),
            tags: Vec::new(),
            accepts_invocations: true,
            accepts_messages: true,
        }
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentQuery {
    /// Case-insensitive substring of the agent name.
    #[serde(default)]
    pub name: Option<String>,
    /// Agents must declare all of these.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Agents must carry at least one of these.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub include_same_origin: bool,
    #[serde(default)]
    pub include_cross_origin: bool,
    #[serde(default)]
    pub include_remote: bool,
}

impl Default for AgentQuery {
    fn default() -> Self {
        Self {
            name: None,
            capabilities: Vec::new(),
            tags: Vec::new(),
            include_same_origin: true,
            include_cross_origin: false,
            include_remote: false,
        }
    }
}

/// Discovery view of an agent. Omits the owner's execution context and usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub kind: AgentKind,
    pub status: AgentStatus,
    pub origin: String,
    pub capabilities: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub accepts_invocations: bool,
    pub accepts_messages: bool,
    pub same_origin: bool,
}

impl AgentSummary {
    pub(crate) fn of(agent: &Agent, viewer_origin: &str) -> Self {
        Self {
            id: agent.id.clone(),
            name: agent.name.clone(),
            description: agent.description.clone(),
            kind: agent.kind.clone(),
            status: agent.status,
            origin: agent.origin.clone(),
            capabilities: agent.capabilities.clone(),
            tags: agent.tags.clone(),
            accepts_invocations: agent.accepts_invocations,
            accepts_messages: agent.accepts_messages,
            same_origin: agent.origin == viewer_origin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub from_origin: String,
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub event_type: String,
    pub from: String,
    pub data: Value,
    pub emitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub task: String,
    #[serde(default)]
    pub input: Value,
    /// Scopes the invoker must itself hold for this call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_scopes: Vec<Scope>,
}

impl InvocationRequest {
    pub fn new(task: impl Into<String>, input: Value) -> Self {
        Self {
            task: task.into(),
            input,
            required_scopes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationError {
    pub code: ErrorCode,
    pub message: String,
}

/// Settled outcome of one invocation. Also the body of a remote agent's
/// `POST /invoke` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<InvocationError>,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub duration_ms: u64,
}

impl InvocationResponse {
    pub fn from_result(agent_id: &str, outcome: Result<Value>, duration_ms: u64) -> Self {
        match outcome {
            Ok(value) => Self {
                success: true,
                result: Some(value),
                error: None,
                agent_id: agent_id.to_string(),
                duration_ms,
            },
            Err(error) => Self {
                success: false,
                result: None,
                error: Some(InvocationError {
                    code: error.code(),
                    message: error.to_string(),
                }),
                agent_id: agent_id.to_string(),
                duration_ms,
            },
        }
    }

    /// Turn the envelope back into a typed result.
    pub fn into_result(self) -> Result<Value> {
        if self.success {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        let Some(error) = self.error else {
            return Err(KernelError::InvocationFailed(format!(
                "agent {} failed without an error",
                self.agent_id
            )));
        };
        Err(match error.code {
            ErrorCode::PermissionDenied => KernelError::PermissionDenied(error.message),
            ErrorCode::AgentNotFound => KernelError::AgentNotFound(self.agent_id),
            ErrorCode::SessionNotFound => KernelError::SessionNotFound(error.message),
            ErrorCode::NotAcceptingInvocations => {
                KernelError::NotAcceptingInvocations(self.agent_id)
            }
            ErrorCode::NotAcceptingMessages => KernelError::NotAcceptingMessages(self.agent_id),
            ErrorCode::InvocationTimeout => KernelError::InvocationTimeout {
                agent_id: self.agent_id,
                timeout_ms: self.duration_ms,
            },
            ErrorCode::Cancelled => KernelError::Cancelled,
            ErrorCode::BudgetExceeded => KernelError::BudgetExceeded(error.message),
            ErrorCode::InvalidRequest => KernelError::InvalidRequest(error.message),
            ErrorCode::InvocationFailed
            | ErrorCode::TransportError
            | ErrorCode::ToolFailed => KernelError::InvocationFailed(error.message),
        })
    }
}

/// Outcome of a broadcast. A failing subscriber never fails the broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    pub delivered: usize,
    pub failed: usize,
}
