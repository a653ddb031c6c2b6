use super::servers::{ServerConfig, validate_servers};
use crate::permissions::PermissionStoreConfig;
use crate::sessions::SessionRegistryConfig;
use crate::transport::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Lifetime of a `granted-once` grant (default: 600)
    #[serde(default = "default_once_grant_ttl_secs")]
    pub once_grant_ttl_secs: u64,
    /// How often expired once-grants are swept (default: 60)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Persist denied and always-granted scopes across restarts (default: true)
    #[serde(default = "default_true")]
    pub persist: bool,
    /// Grant file; defaults to `permissions.toml` next to the config file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grants_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Idle sessions are reclaimed after this many seconds (default: 3600)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Terminated sessions are dropped after this grace window (default: 300)
    #[serde(default = "default_terminated_grace_secs")]
    pub terminated_grace_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Messages kept per session; older ones are dropped first (default: 200)
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationConfig {
    /// Default invocation timeout in milliseconds (default: 30000)
    #[serde(default = "default_invocation_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Timeout for remote agent HTTP calls (default: 30000)
    #[serde(default = "default_invocation_timeout_ms")]
    pub remote_timeout_ms: u64,
    /// Remote agent health check period (default: 60)
    #[serde(default = "default_sweep_interval_secs")]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Default per-request timeout (default: 30)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_true() -> bool {
    true
}

fn default_once_grant_ttl_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    3600
}

fn default_terminated_grace_secs() -> u64 {
    300
}

fn default_max_history() -> usize {
    200
}

fn default_invocation_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            once_grant_ttl_secs: default_once_grant_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            persist: true,
            grants_file: None,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            terminated_grace_secs: default_terminated_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_history: default_max_history(),
        }
    }
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_invocation_timeout_ms(),
            remote_timeout_ms: default_invocation_timeout_ms(),
            health_check_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Top-level kernel configuration (`~/.harbor/config.toml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub permissions: PermissionsConfig,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub invocation: InvocationConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl KernelConfig {
    #[must_use]
    pub fn permission_store_config(&self) -> PermissionStoreConfig {
        PermissionStoreConfig {
            once_grant_ttl: Duration::from_secs(self.permissions.once_grant_ttl_secs),
        }
    }

    #[must_use]
    pub fn session_registry_config(&self) -> SessionRegistryConfig {
        SessionRegistryConfig {
            idle_timeout: Duration::from_secs(self.sessions.idle_timeout_secs),
            terminated_grace: Duration::from_secs(self.sessions.terminated_grace_secs),
            max_history: self.sessions.max_history,
        }
    }

    /// Where grants are persisted, or `None` when persistence is off.
    #[must_use]
    pub fn grants_path(&self) -> Option<PathBuf> {
        if !self.permissions.persist {
            return None;
        }
        match &self.permissions.grants_file {
            Some(file) => Some(PathBuf::from(shellexpand::tilde(file).into_owned())),
            None => Some(
                self.config_path
                    .parent()
                    .map_or_else(|| PathBuf::from("."), std::path::Path::to_path_buf)
                    .join("permissions.toml"),
            ),
        }
    }

    #[must_use]
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation.default_timeout_ms)
    }

    /// Return only enabled servers.
    #[must_use]
    pub fn enabled_servers(&self) -> Vec<&ServerConfig> {
        self.servers
            .iter()
            .filter(|server| server.enabled)
            .collect()
    }

    /// Validate the configuration, returning one message per problem.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.permissions.once_grant_ttl_secs == 0 {
            errors.push("permissions.once_grant_ttl_secs must be > 0".to_string());
        }
        for (label, value) in [
            ("permissions.sweep_interval_secs", self.permissions.sweep_interval_secs),
            ("sessions.sweep_interval_secs", self.sessions.sweep_interval_secs),
            ("sessions.idle_timeout_secs", self.sessions.idle_timeout_secs),
            ("invocation.default_timeout_ms", self.invocation.default_timeout_ms),
            ("invocation.remote_timeout_ms", self.invocation.remote_timeout_ms),
            ("transport.request_timeout_secs", self.transport.request_timeout_secs),
        ] {
            if value == 0 {
                errors.push(format!("{label} must be > 0"));
            }
        }

        let reconnect = &self.transport.reconnect;
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            errors.push(format!(
                "transport.reconnect.max_delay_ms ({}) must be >= base_delay_ms ({})",
                reconnect.max_delay_ms, reconnect.base_delay_ms
            ));
        }

        errors.extend(validate_servers(&self.servers));
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: KernelConfig = toml::from_str("").unwrap();
        assert_eq!(config.permissions.once_grant_ttl_secs, 600);
        assert_eq!(config.sessions.idle_timeout_secs, 3600);
        assert_eq!(config.sessions.terminated_grace_secs, 300);
        assert_eq!(config.sessions.max_history, 200);
        assert_eq!(config.invocation.default_timeout_ms, 30_000);
        assert!(config.transport.reconnect.auto_reconnect);
        assert!(config.servers.is_empty());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: KernelConfig = toml::from_str(
            r#"
[permissions]
once_grant_ttl_secs = 30

[transport.reconnect]
auto_reconnect = false
"#,
        )
        .unwrap();
        assert_eq!(config.permissions.once_grant_ttl_secs, 30);
        assert!(config.permissions.persist);
        assert!(!config.transport.reconnect.auto_reconnect);
        assert_eq!(config.transport.reconnect.max_attempts, 5);
        assert_eq!(
            config.permission_store_config().once_grant_ttl,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn grants_path_follows_config_dir_or_override() {
        let mut config = KernelConfig {
            config_path: PathBuf::from("/srv/harbor/config.toml"),
            ..KernelConfig::default()
        };
        assert_eq!(
            config.grants_path(),
            Some(PathBuf::from("/srv/harbor/permissions.toml"))
        );

        config.permissions.grants_file = Some("/var/lib/harbor/grants.toml".into());
        assert_eq!(
            config.grants_path(),
            Some(PathBuf::from("/var/lib/harbor/grants.toml"))
        );

        config.permissions.persist = false;
        assert_eq!(config.grants_path(), None);
    }

    #[test]
    fn validate_reports_zero_values_and_backoff_inversion() {
        let mut config = KernelConfig::default();
        config.permissions.once_grant_ttl_secs = 0;
        config.invocation.default_timeout_ms = 0;
        config.transport.reconnect.base_delay_ms = 5_000;
        config.transport.reconnect.max_delay_ms = 100;

        let errors = config.validate();
        assert!(errors.iter().any(|error| error.contains("once_grant_ttl_secs")));
        assert!(errors.iter().any(|error| error.contains("default_timeout_ms")));
        assert!(errors.iter().any(|error| error.contains("max_delay_ms")));
    }
}
