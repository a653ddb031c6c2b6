pub mod schema;

pub use schema::{
    InvocationConfig, KernelConfig, PermissionsConfig, ServerConfig, ServerTransport,
    SessionsConfig, TransportConfig,
};
