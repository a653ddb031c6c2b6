use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// `harbor` - operator console for the Harbor kernel.
#[derive(Parser, Debug)]
#[command(name = "harbor")]
#[command(version)]
#[command(
    about = "Inspect grants, tool servers and configuration of a Harbor kernel.",
    long_about = None
)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.harbor/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect and edit per-origin grants
    Permissions {
        #[command(subcommand)]
        permission_command: PermissionCommands,
    },

    /// Talk to configured tool servers
    Servers {
        #[command(subcommand)]
        server_command: ServerCommands,
    },

    /// Show or validate the configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum PermissionCommands {
    /// List origins with stored grants, or every scope of one origin
    List {
        origin: Option<String>,
    },
    /// Grant scopes to an origin without prompting
    Grant {
        origin: String,
        /// Scope names, e.g. call-tool prompt-model
        #[arg(required = true)]
        scopes: Vec<String>,
        /// Grant once instead of always
        #[arg(long)]
        once: bool,
        /// Allow a tool (repeatable)
        #[arg(long = "tool")]
        tools: Vec<String>,
    },
    /// Deny scopes until revoked
    Deny {
        origin: String,
        #[arg(required = true)]
        scopes: Vec<String>,
    },
    /// Forget everything stored for an origin
    Revoke { origin: String },
    /// Run the interactive request flow for an origin
    Request {
        origin: String,
        #[arg(required = true)]
        scopes: Vec<String>,
        #[arg(long = "tool")]
        tools: Vec<String>,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ServerCommands {
    /// List configured servers
    List,
    /// List the tools one server advertises
    Tools { server: String },
    /// Call a tool on a server
    Call {
        server: String,
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Report configuration problems
    Validate,
}
