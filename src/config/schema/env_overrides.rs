use super::KernelConfig;

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl KernelConfig {
    pub fn apply_env_overrides(&mut self) {
        if let Some(ttl) = env_u64("HARBOR_ONCE_GRANT_TTL_SECS")
            && ttl > 0
        {
            self.permissions.once_grant_ttl_secs = ttl;
        }

        if let Ok(file) = std::env::var("HARBOR_GRANTS_FILE")
            && !file.is_empty()
        {
            self.permissions.grants_file = Some(file);
        }

        if let Some(persist) = env_bool("HARBOR_PERSIST_GRANTS") {
            self.permissions.persist = persist;
        }

        if let Some(idle) = env_u64("HARBOR_SESSION_IDLE_SECS")
            && idle > 0
        {
            self.sessions.idle_timeout_secs = idle;
        }

        if let Some(timeout) = env_u64("HARBOR_INVOCATION_TIMEOUT_MS")
            && timeout > 0
        {
            self.invocation.default_timeout_ms = timeout;
        }

        if let Some(timeout) = env_u64("HARBOR_REQUEST_TIMEOUT_SECS")
            && timeout > 0
        {
            self.transport.request_timeout_secs = timeout;
        }

        if let Some(enabled) = env_bool("HARBOR_AUTO_RECONNECT") {
            self.transport.reconnect.auto_reconnect = enabled;
        }
    }
}
