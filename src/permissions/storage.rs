use super::{Grant, OriginPermissions, Scope, ScopeGrant};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Persistent key-value backing for the permission store.
///
/// Only the permission store persists; session and agent registries are
/// volatile by design.
pub trait GrantStorage: Send + Sync {
    fn load(&self) -> Result<HashMap<String, OriginPermissions>>;

    fn save(&self, origins: &HashMap<String, OriginPermissions>) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct PermissionFile {
    #[serde(default)]
    origins: Vec<StoredOrigin>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredOrigin {
    origin: String,
    #[serde(default)]
    allowed_tools: Vec<String>,
    #[serde(default)]
    grants: Vec<StoredGrant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredGrant {
    scope: Scope,
    grant: Grant,
    granted_at: String,
}

/// `permissions.toml` in the kernel's data directory, mode `0o600` on unix.
#[derive(Debug, Clone)]
pub struct TomlGrantStorage {
    path: PathBuf,
}

impl TomlGrantStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GrantStorage for TomlGrantStorage {
    fn load(&self) -> Result<HashMap<String, OriginPermissions>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new());
            }
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("failed to read permissions file '{}'", self.path.display())
                });
            }
        };

        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        let file: PermissionFile = toml::from_str(&content).with_context(|| {
            format!("failed to parse permissions file '{}'", self.path.display())
        })?;

        Ok(file
            .origins
            .into_iter()
            .map(|stored| (stored.origin.clone(), stored_to_origin(stored)))
            .collect())
    }

    fn save(&self, origins: &HashMap<String, OriginPermissions>) -> Result<()> {
        let mut stored: Vec<StoredOrigin> = origins
            .iter()
            .filter_map(|(origin, permissions)| origin_to_stored(origin, permissions))
            .collect();
        stored.sort_by(|a, b| a.origin.cmp(&b.origin));

        let content = toml::to_string(&PermissionFile { origins: stored })
            .context("failed to serialize permissions")?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create permissions parent directory '{}'",
                    parent.display()
                )
            })?;
        }

        fs::write(&self.path, content).with_context(|| {
            format!("failed to write permissions file '{}'", self.path.display())
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600)).with_context(
                || format!("failed to set permissions on '{}'", self.path.display()),
            )?;
        }

        Ok(())
    }
}

/// Once-grants are bound to live execution contexts and never outlive the
/// process, so only `Denied` and `GrantedAlways` are written.
fn origin_to_stored(origin: &str, permissions: &OriginPermissions) -> Option<StoredOrigin> {
    let grants: Vec<StoredGrant> = permissions
        .scopes
        .iter()
        .filter(|(_, scope_grant)| {
            matches!(scope_grant.grant, Grant::Denied | Grant::GrantedAlways)
        })
        .map(|(scope, scope_grant)| StoredGrant {
            scope: *scope,
            grant: scope_grant.grant,
            granted_at: scope_grant.granted_at.to_rfc3339(),
        })
        .collect();

    if grants.is_empty() && permissions.allowed_tools.is_empty() {
        return None;
    }

    Some(StoredOrigin {
        origin: origin.to_string(),
        allowed_tools: permissions.allowed_tools.iter().cloned().collect(),
        grants,
        updated_at: permissions.updated_at.map(|at| at.to_rfc3339()),
    })
}

fn stored_to_origin(stored: StoredOrigin) -> OriginPermissions {
    let scopes = stored
        .grants
        .into_iter()
        .map(|grant| {
            (
                grant.scope,
                ScopeGrant {
                    grant: grant.grant,
                    granted_at: parse_timestamp(&grant.granted_at).unwrap_or_else(Utc::now),
                    expires_at: None,
                    exec_ctx: None,
                },
            )
        })
        .collect();

    OriginPermissions {
        scopes,
        allowed_tools: stored.allowed_tools.into_iter().collect::<BTreeSet<_>>(),
        updated_at: stored.updated_at.as_deref().and_then(parse_timestamp),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}
