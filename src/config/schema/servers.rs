use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

fn default_max_call_seconds() -> u64 {
    30
}

fn default_enabled_true() -> bool {
    true
}

/// Configuration for a single tool-server connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique name for this server.
    pub name: String,

    /// Transport kind.
    #[serde(default)]
    pub transport: ServerTransport,

    /// Whether this server is connected at startup.
    #[serde(default = "default_enabled_true")]
    pub enabled: bool,

    /// Maximum seconds per request. Overrides `[transport] request_timeout_secs`.
    #[serde(default = "default_max_call_seconds")]
    pub max_call_seconds: u64,
}

/// Transport configuration for a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerTransport {
    /// Spawns a child process speaking newline-delimited JSON.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Server-sent events for responses, POST for requests.
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// One full-duplex socket.
    #[serde(rename = "websocket")]
    WebSocket { url: String },
}

impl Default for ServerTransport {
    fn default() -> Self {
        Self::Stdio {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// Validate server entries, returning one message per problem.
#[must_use]
pub fn validate_servers(servers: &[ServerConfig]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut names: HashSet<&str> = HashSet::new();

    for server in servers {
        if server.name.is_empty() {
            errors.push("server name cannot be empty".to_string());
        }
        if !names.insert(server.name.as_str()) {
            errors.push(format!("Duplicate server name: {}", server.name));
        }
        match &server.transport {
            ServerTransport::Stdio { command, .. } => {
                if command.is_empty() {
                    errors.push(format!(
                        "server '{}': stdio transport requires a command",
                        server.name
                    ));
                }
            }
            ServerTransport::Sse { url, .. } => {
                check_url(&server.name, "sse", url, &["http", "https"], &mut errors);
            }
            ServerTransport::WebSocket { url } => {
                check_url(&server.name, "websocket", url, &["ws", "wss"], &mut errors);
            }
        }
        if server.max_call_seconds == 0 {
            errors.push(format!(
                "server '{}': max_call_seconds must be > 0",
                server.name
            ));
        }
    }

    errors
}

fn check_url(name: &str, kind: &str, url: &str, schemes: &[&str], errors: &mut Vec<String>) {
    if url.is_empty() {
        errors.push(format!("server '{name}': {kind} transport requires a url"));
        return;
    }
    match url::Url::parse(url) {
        Ok(parsed) if schemes.contains(&parsed.scheme()) => {}
        Ok(parsed) => errors.push(format!(
            "server '{name}': {kind} url scheme '{}' is not one of {}",
            parsed.scheme(),
            schemes.join(", ")
        )),
        Err(error) => errors.push(format!("server '{name}': invalid url '{url}': {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio(name: &str, command: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            transport: ServerTransport::Stdio {
                command: command.to_string(),
                args: vec![],
                env: HashMap::new(),
            },
            enabled: true,
            max_call_seconds: 30,
        }
    }

    #[test]
    fn deserialize_all_transport_kinds() {
        let toml_str = r#"
[[servers]]
name = "fs"
[servers.transport]
kind = "stdio"
command = "fs-server"
args = ["--root", "/tmp"]

[[servers]]
name = "remote"
max_call_seconds = 5
[servers.transport]
kind = "sse"
url = "https://tools.example.com/sse"

[[servers]]
name = "socket"
enabled = false
[servers.transport]
kind = "websocket"
url = "wss://tools.example.com/ws"
"#;
        #[derive(Deserialize)]
        struct Wrapper {
            servers: Vec<ServerConfig>,
        }
        let parsed: Wrapper = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.servers.len(), 3);
        assert_eq!(parsed.servers[0].max_call_seconds, 30);
        assert!(matches!(
            parsed.servers[1].transport,
            ServerTransport::Sse { ref url, .. } if url.ends_with("/sse")
        ));
        assert!(!parsed.servers[2].enabled);
        assert!(matches!(
            parsed.servers[2].transport,
            ServerTransport::WebSocket { .. }
        ));
        assert!(validate_servers(&parsed.servers).is_empty());
    }

    #[test]
    fn validate_rejects_empty_and_duplicate_names() {
        let errors = validate_servers(&[stdio("", "echo"), stdio("a", "echo"), stdio("a", "echo")]);
        assert!(errors.iter().any(|error| error.contains("cannot be empty")));
        assert!(errors.iter().any(|error| error.contains("Duplicate")));
    }

    #[test]
    fn validate_rejects_empty_stdio_command() {
        let errors = validate_servers(&[stdio("bad", "")]);
        assert!(
            errors
                .iter()
                .any(|error| error.contains("requires a command"))
        );
    }

    #[test]
    fn validate_checks_url_schemes() {
        let servers = vec![
            ServerConfig {
                name: "sse".into(),
                transport: ServerTransport::Sse {
                    url: "ws://wrong".into(),
                    headers: HashMap::new(),
                },
                enabled: true,
                max_call_seconds: 30,
            },
            ServerConfig {
                name: "ws".into(),
                transport: ServerTransport::WebSocket { url: String::new() },
                enabled: true,
                max_call_seconds: 30,
            },
        ];
        let errors = validate_servers(&servers);
        assert!(errors.iter().any(|error| error.contains("scheme 'ws'")));
        assert!(errors.iter().any(|error| error.contains("requires a url")));
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut server = stdio("slow", "echo");
        server.max_call_seconds = 0;
        assert!(
            validate_servers(&[server])
                .iter()
                .any(|error| error.contains("max_call_seconds"))
        );
    }
}
