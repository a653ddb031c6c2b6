use crate::cli::commands::{Cli, Commands, ConfigCommands, PermissionCommands, ServerCommands};
use anyhow::{Context, Result, anyhow, bail};
use harbor_kernel::config::{KernelConfig, ServerTransport};
use harbor_kernel::permissions::{CliPromptSurface, GrantKind, PromptRequest, Scope};
use harbor_kernel::Kernel;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;

pub async fn dispatch(cli: Cli, config: KernelConfig) -> Result<()> {
    match cli.command {
        Commands::Permissions { permission_command } => {
            let kernel = Kernel::new(config, Arc::new(CliPromptSurface::default_timeout()));
            handle_permissions(&kernel, permission_command).await
        }
        Commands::Servers { server_command } => handle_servers(config, server_command).await,
        Commands::Config { config_command } => handle_config(&config, config_command),
    }
}

fn parse_scopes(names: &[String]) -> Result<Vec<Scope>> {
    names
        .iter()
        .map(|name| {
            Scope::from_str(name.trim()).map_err(|_| {
                let known = Scope::all().map(|scope| scope.to_string()).collect::<Vec<_>>();
                anyhow!("unknown scope '{name}' (known: {})", known.join(", "))
            })
        })
        .collect()
}

async fn handle_permissions(kernel: &Kernel, command: PermissionCommands) -> Result<()> {
    let store = kernel.permissions();
    match command {
        PermissionCommands::List { origin: None } => {
            let origins = store.list_origins();
            if origins.is_empty() {
                println!("No stored grants.");
            }
            for origin in origins {
                println!("{origin}");
            }
        }
        PermissionCommands::List {
            origin: Some(origin),
        } => {
            let resolved = store.resolve(&origin, None);
            for (scope, grant) in &resolved.grants {
                match resolved.once_expiries.get(scope) {
                    Some(expires_at) => println!("{scope:<24} {grant} (until {expires_at})"),
                    None => println!("{scope:<24} {grant}"),
                }
            }
            if !resolved.allowed_tools.is_empty() {
                let tools: Vec<&str> = resolved.allowed_tools.iter().map(String::as_str).collect();
                println!("{:<24} {}", "allowed tools", tools.join(", "));
            }
        }
        PermissionCommands::Grant {
            origin,
            scopes,
            once,
            tools,
        } => {
            let kind = if once { GrantKind::Once } else { GrantKind::Always };
            store.grant(&origin, &parse_scopes(&scopes)?, kind, None, &tools)?;
            println!("Granted {} to {origin} ({kind}).", scopes.join(", "));
        }
        PermissionCommands::Deny { origin, scopes } => {
            store.deny(&origin, &parse_scopes(&scopes)?)?;
            println!("Denied {} for {origin}.", scopes.join(", "));
        }
        PermissionCommands::Revoke { origin } => {
            if store.revoke(&origin)? {
                println!("Revoked every grant of {origin}.");
            } else {
                println!("{origin} had no stored grants.");
            }
        }
        PermissionCommands::Request {
            origin,
            scopes,
            tools,
            reason,
        } => {
            let request = PromptRequest {
                origin,
                scopes: parse_scopes(&scopes)?,
                reason,
                tools,
            };
            let outcome = kernel.request_permissions(&request, None).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }
    Ok(())
}

async fn handle_servers(config: KernelConfig, command: ServerCommands) -> Result<()> {
    match command {
        ServerCommands::List => {
            if config.servers.is_empty() {
                println!(
                    "No servers configured. Add [[servers]] entries to {}.",
                    config.config_path.display()
                );
            }
            for server in &config.servers {
                let target = match &server.transport {
                    ServerTransport::Stdio { command, args, .. } => {
                        format!("stdio  {command} {}", args.join(" "))
                    }
                    ServerTransport::Sse { url, .. } => format!("sse    {url}"),
                    ServerTransport::WebSocket { url } => format!("ws     {url}"),
                };
                let state = if server.enabled { "" } else { " (disabled)" };
                println!("{:<20} {}{state}", server.name, target.trim_end());
            }
        }
        ServerCommands::Tools { server } => {
            let kernel = Kernel::new(config, Arc::new(CliPromptSurface::default_timeout()));
            let tools = kernel.servers().list_tools(&server).await?;
            for tool in tools {
                println!(
                    "{:<24} {}",
                    tool.name,
                    tool.description.as_deref().unwrap_or_default()
                );
            }
            kernel.servers().disconnect_all().await;
        }
        ServerCommands::Call { server, tool, args } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object");
            }
            let kernel = Kernel::new(config, Arc::new(CliPromptSurface::default_timeout()));
            let result = kernel.servers().call_tool(&server, &tool, arguments).await;
            kernel.servers().disconnect_all().await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
    }
    Ok(())
}

fn handle_config(config: &KernelConfig, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            println!("# {}", config.config_path.display());
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigCommands::Validate => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration OK.");
            } else {
                for problem in &problems {
                    println!("- {problem}");
                }
                bail!("{} configuration problem(s)", problems.len());
            }
        }
    }
    Ok(())
}
