use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Created on first prompt without an explicit request.
    Implicit,
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Suspended,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl SessionMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmCapability {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCapability {
    pub allowed: bool,
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserCapability {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub interact: bool,
    #[serde(default)]
    pub screenshot: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_calls: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Bounded capability set of one session. Derived from the owning origin's
/// grants at creation time and never wider than them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCapabilities {
    pub llm: LlmCapability,
    pub tools: ToolCapability,
    pub browser: BrowserCapability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<SessionLimits>,
}

impl SessionCapabilities {
    #[must_use]
    pub fn max_tool_calls(&self) -> Option<u32> {
        self.limits.and_then(|limits| limits.max_tool_calls)
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.limits.and_then(|limits| limits.expires_at)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUsage {
    pub prompt_count: u64,
    pub tool_call_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub kind: SessionKind,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_ctx: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: SessionStatus,
    pub capabilities: SessionCapabilities,
    #[serde(default)]
    pub history: Vec<SessionMessage>,
    pub usage: SessionUsage,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
}

impl Session {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.capabilities
            .expires_at()
            .is_some_and(|expires_at| expires_at <= now)
    }

    #[must_use]
    pub fn tool_budget_exhausted(&self) -> bool {
        self.capabilities
            .max_tool_calls()
            .is_some_and(|max| self.usage.tool_call_count >= max)
    }
}

/// Options for a session created implicitly by a prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplicitSessionOptions {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// What an explicit session asks for. Anything the origin does not hold is
/// dropped from the granted set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub llm: Option<ImplicitSessionOptions>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub browser: BrowserCapability,
    #[serde(default)]
    pub limits: Option<SessionLimits>,
}
