//! Agent identity, discovery, messaging and invocation.

pub mod messaging;
pub mod registry;
pub mod remote;
pub mod types;

pub use messaging::{HandlerFuture, MessagingEngine};
pub use registry::AgentRegistry;
pub use remote::RemoteAgentClient;
pub use types::{
    Agent, AgentEvent, AgentKind, AgentMessage, AgentOptions, AgentQuery, AgentStatus,
    AgentSummary, AgentUsage, BroadcastResult, InvocationError, InvocationRequest,
    InvocationResponse, UsageKind,
};
