use super::storage::{GrantStorage, TomlGrantStorage};
use super::{
    CheckResult, Grant, GrantKind, OriginPermissions, PermissionStatus, Scope, ScopeGrant,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_ONCE_GRANT_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct PermissionStoreConfig {
    /// Lifetime of a `granted-once` grant.
    pub once_grant_ttl: Duration,
}

impl Default for PermissionStoreConfig {
    fn default() -> Self {
        Self {
            once_grant_ttl: DEFAULT_ONCE_GRANT_TTL,
        }
    }
}

/// Consistent single-read view of an origin, resolved for one context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPermissions {
    pub grants: PermissionStatus,
    /// Expiry of every scope currently resolved as `granted-once`.
    pub once_expiries: BTreeMap<Scope, DateTime<Utc>>,
    pub allowed_tools: BTreeSet<String>,
}

/// Process-wide grant map keyed by origin.
///
/// Reads go through one mutex, so a reader never observes a half-applied
/// grant. Mutators serialize on a separate writer lock and save a snapshot to
/// storage before swapping it in, so readers never wait on disk I/O.
pub struct PermissionStore {
    origins: Mutex<HashMap<String, OriginPermissions>>,
    writer: Mutex<()>,
    storage: Option<Box<dyn GrantStorage>>,
    config: PermissionStoreConfig,
}

impl PermissionStore {
    pub fn in_memory(config: PermissionStoreConfig) -> Self {
        Self {
            origins: Mutex::new(HashMap::new()),
            writer: Mutex::new(()),
            storage: None,
            config,
        }
    }

    pub fn with_storage(storage: Box<dyn GrantStorage>, config: PermissionStoreConfig) -> Self {
        let origins = storage.load().unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to load stored permissions; starting with empty grants");
            HashMap::new()
        });

        Self {
            origins: Mutex::new(origins),
            writer: Mutex::new(()),
            storage: Some(storage),
            config,
        }
    }

    pub fn load(path: &Path, config: PermissionStoreConfig) -> Self {
        Self::with_storage(Box::new(TomlGrantStorage::new(path)), config)
    }

    pub fn get_status(&self, origin: &str, exec_ctx: Option<&str>) -> PermissionStatus {
        self.resolve(origin, exec_ctx).grants
    }

    pub fn grant_for(&self, origin: &str, scope: Scope, exec_ctx: Option<&str>) -> Grant {
        let now = Utc::now();
        self.lock()
            .get(origin)
            .and_then(|permissions| permissions.scopes.get(&scope))
            .map_or(Grant::NotGranted, |grant| grant.resolve(exec_ctx, now))
    }

    pub fn resolve(&self, origin: &str, exec_ctx: Option<&str>) -> ResolvedPermissions {
        let now = Utc::now();
        let origins = self.lock();
        let permissions = origins.get(origin);

        let mut resolved = ResolvedPermissions::default();
        for scope in Scope::all() {
            let stored = permissions.and_then(|permissions| permissions.scopes.get(&scope));
            let grant = stored.map_or(Grant::NotGranted, |grant| grant.resolve(exec_ctx, now));
            if grant == Grant::GrantedOnce
                && let Some(expires_at) = stored.and_then(|stored| stored.expires_at)
            {
                resolved.once_expiries.insert(scope, expires_at);
            }
            resolved.grants.insert(scope, grant);
        }
        if let Some(permissions) = permissions {
            resolved.allowed_tools.clone_from(&permissions.allowed_tools);
        }
        resolved
    }

    pub fn check(&self, origin: &str, scopes: &[Scope], exec_ctx: Option<&str>) -> CheckResult {
        let status = self.get_status(origin, exec_ctx);
        let mut result = CheckResult::default();

        for scope in scopes {
            match status.get(scope).copied().unwrap_or(Grant::NotGranted) {
                Grant::Denied => result.denied.push(*scope),
                Grant::NotGranted => result.missing.push(*scope),
                Grant::GrantedOnce | Grant::GrantedAlways => {}
            }
        }

        result.granted = result.missing.is_empty() && result.denied.is_empty();
        result
    }

    /// Record a positive decision.
    ///
    /// A scope that is currently `denied` stays denied; only [`Self::revoke`]
    /// clears a denial. An existing `granted-always` is never downgraded.
    pub fn grant(
        &self,
        origin: &str,
        scopes: &[Scope],
        kind: GrantKind,
        exec_ctx: Option<&str>,
        tools: &[String],
    ) -> Result<PermissionStatus> {
        let now = Utc::now();
        let expires_at = match kind {
            GrantKind::Once => Some(now + self.once_grant_ttl()),
            GrantKind::Always => None,
        };

        self.mutate(|origins| {
            let permissions = origins.entry(origin.to_string()).or_default();
            for scope in scopes {
                match permissions.scopes.get(scope).map(|existing| existing.grant) {
                    Some(Grant::Denied) => {
                        tracing::warn!(origin, %scope, "ignoring grant for denied scope");
                        continue;
                    }
                    Some(Grant::GrantedAlways) if kind == GrantKind::Once => continue,
                    _ => {}
                }
                permissions.scopes.insert(
                    *scope,
                    ScopeGrant {
                        grant: kind.into(),
                        granted_at: now,
                        expires_at,
                        exec_ctx: match kind {
                            GrantKind::Once => exec_ctx.map(str::to_string),
                            GrantKind::Always => None,
                        },
                    },
                );
            }
            permissions
                .allowed_tools
                .extend(tools.iter().filter(|tool| !tool.trim().is_empty()).cloned());
            permissions.updated_at = Some(now);
        })?;

        tracing::info!(origin, ?scopes, %kind, tools = tools.len(), "permissions granted");
        Ok(self.get_status(origin, exec_ctx))
    }

    pub fn deny(&self, origin: &str, scopes: &[Scope]) -> Result<PermissionStatus> {
        let now = Utc::now();
        self.mutate(|origins| {
            let permissions = origins.entry(origin.to_string()).or_default();
            for scope in scopes {
                permissions.scopes.insert(
                    *scope,
                    ScopeGrant {
                        grant: Grant::Denied,
                        granted_at: now,
                        expires_at: None,
                        exec_ctx: None,
                    },
                );
            }
            permissions.updated_at = Some(now);
        })?;

        tracing::info!(origin, ?scopes, "permissions denied");
        Ok(self.get_status(origin, None))
    }

    /// Forget everything about an origin, including sticky denials.
    pub fn revoke(&self, origin: &str) -> Result<bool> {
        let removed = self.mutate(|origins| origins.remove(origin).is_some())?;
        if removed {
            tracing::info!(origin, "permissions revoked");
        }
        Ok(removed)
    }

    /// Downgrade expired once-grants to `not-granted`. Returns how many were
    /// downgraded.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let _writer = self.lock_writer();
        let mut origins = self.lock();
        let mut swept = 0;

        for permissions in origins.values_mut() {
            let before = permissions.scopes.len();
            permissions
                .scopes
                .retain(|_, scope_grant| !scope_grant.is_expired(now));
            swept += before - permissions.scopes.len();
        }

        if swept > 0 {
            tracing::debug!(swept, "expired once-grants swept");
        }
        swept
    }

    pub fn allowed_tools(&self, origin: &str) -> BTreeSet<String> {
        self.lock()
            .get(origin)
            .map(|permissions| permissions.allowed_tools.clone())
            .unwrap_or_default()
    }

    /// `call-tool` must currently be valid for the context and the tool must
    /// be on the origin's allow-list.
    pub fn is_tool_allowed(&self, origin: &str, tool: &str, exec_ctx: Option<&str>) -> bool {
        let now = Utc::now();
        let origins = self.lock();
        let Some(permissions) = origins.get(origin) else {
            return false;
        };
        let call_tool = permissions
            .scopes
            .get(&Scope::CallTool)
            .map_or(Grant::NotGranted, |grant| grant.resolve(exec_ctx, now));
        call_tool.is_granted() && permissions.allowed_tools.contains(tool)
    }

    pub fn permissions_for(&self, origin: &str) -> Option<OriginPermissions> {
        self.lock().get(origin).cloned()
    }

    pub fn list_origins(&self) -> Vec<String> {
        let mut origins: Vec<String> = self.lock().keys().cloned().collect();
        origins.sort();
        origins
    }

    fn once_grant_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.once_grant_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(10))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, OriginPermissions>> {
        self.origins
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, ()> {
        self.writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut HashMap<String, OriginPermissions>) -> T,
    ) -> Result<T> {
        let _writer = self.lock_writer();
        let mut next = self.lock().clone();
        let output = apply(&mut next);
        if let Some(storage) = &self.storage {
            storage.save(&next)?;
        }
        *self.lock() = next;
        Ok(output)
    }
}
