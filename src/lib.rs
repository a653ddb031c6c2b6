#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::unnecessary_literal_bound,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod agents;
pub mod config;
pub mod error;
pub mod kernel;
pub mod llm;
pub mod orchestration;
pub mod permissions;
pub mod sessions;
pub mod transport;

pub use config::KernelConfig;
pub use error::{ErrorCode, KernelError, Result, TransportError};
pub use kernel::{CleanupReport, Kernel, ToolCallRequest};
