//! Sessions: a bounded capability set for one conversational context.

pub mod registry;
pub mod types;

pub use registry::{SessionRegistry, SessionRegistryConfig, SweepReport};
pub use types::{
    BrowserCapability, ImplicitSessionOptions, LlmCapability, MessageRole, Session,
    SessionCapabilities, SessionKind, SessionLimits, SessionMessage, SessionRequest,
    SessionStatus, SessionUsage, ToolCapability,
};
