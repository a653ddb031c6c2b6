use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for the Harbor kernel.
///
/// Permission and not-found failures are surfaced to the immediate caller and
/// never retried. Transport failures carry their own sub-taxonomy; the
/// transport layer reconnects on its own, but an in-flight request that fails
/// is never re-sent silently.
#[derive(Debug, Error)]
pub enum KernelError {
    // ── Permissions ─────────────────────────────────────────────────────
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // ── Registries ──────────────────────────────────────────────────────
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent {0} does not accept invocations")]
    NotAcceptingInvocations(String),

    #[error("agent {0} does not accept messages")]
    NotAcceptingMessages(String),

    // ── Invocation ──────────────────────────────────────────────────────
    #[error("invocation of agent {agent_id} timed out after {timeout_ms}ms")]
    InvocationTimeout { agent_id: String, timeout_ms: u64 },

    #[error("invocation failed: {0}")]
    InvocationFailed(String),

    #[error("cancelled")]
    Cancelled,

    // ── Budgets ─────────────────────────────────────────────────────────
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    // ── Transport ───────────────────────────────────────────────────────
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("server {server} rejected {method}: {message}")]
    ToolFailed {
        server: String,
        method: String,
        message: String,
    },

    // ── Orchestration ───────────────────────────────────────────────────
    #[error("orchestration: {0}")]
    Orchestration(String),

    // ── Requests / Config ───────────────────────────────────────────────
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config: {0}")]
    Config(String),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KernelError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::AgentNotFound(_) => ErrorCode::AgentNotFound,
            Self::NotAcceptingInvocations(_) => ErrorCode::NotAcceptingInvocations,
            Self::NotAcceptingMessages(_) => ErrorCode::NotAcceptingMessages,
            Self::InvocationTimeout { .. } => ErrorCode::InvocationTimeout,
            Self::InvocationFailed(_) | Self::Orchestration(_) | Self::Other(_) => {
                ErrorCode::InvocationFailed
            }
            Self::Cancelled => ErrorCode::Cancelled,
            Self::BudgetExceeded(_) => ErrorCode::BudgetExceeded,
            Self::Transport(_) => ErrorCode::TransportError,
            Self::ToolFailed { .. } => ErrorCode::ToolFailed,
            Self::InvalidRequest(_) | Self::Config(_) => ErrorCode::InvalidRequest,
        }
    }

    /// Whether the kernel's caller may reasonably try again with a fresh request.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvocationTimeout { .. } | Self::InvocationFailed(_) | Self::Transport(_)
        )
    }
}

/// Stable machine-readable error codes carried in invocation responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PermissionDenied,
    SessionNotFound,
    AgentNotFound,
    InvocationTimeout,
    InvocationFailed,
    NotAcceptingInvocations,
    NotAcceptingMessages,
    Cancelled,
    BudgetExceeded,
    TransportError,
    ToolFailed,
    InvalidRequest,
}

// ─── Transport errors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request {id} timed out after {timeout_ms}ms")]
    Timeout { id: String, timeout_ms: u64 },

    #[error("request id {0} is already pending")]
    DuplicateId(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("unknown server: {0}")]
    UnknownServer(String),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, KernelError>;
