mod env_overrides;
mod kernel;
mod loader;
mod servers;
#[cfg(test)]
mod test_env;

pub use kernel::{
    InvocationConfig, KernelConfig, PermissionsConfig, SessionsConfig, TransportConfig,
};
pub use servers::{ServerConfig, ServerTransport, validate_servers};
