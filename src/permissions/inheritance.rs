//! Effective permissions across an invocation boundary.
//!
//! For every scope the effective grant is the more restrictive of the
//! invoker's and the target's grant, and allowed tools are intersected. This
//! holds for same-origin pairs too: an invoked agent never does more than
//! either party could on its own.

use super::store::{PermissionStore, ResolvedPermissions};
use super::{Grant, PermissionStatus, Scope};
use crate::error::{KernelError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePermissions {
    pub grants: PermissionStatus,
    pub allowed_tools: BTreeSet<String>,
    /// Per-scope expiry for scopes that are only `granted-once` on either side.
    #[serde(default)]
    pub once_expiries: BTreeMap<Scope, DateTime<Utc>>,
}

impl EffectivePermissions {
    #[must_use]
    pub fn grant(&self, scope: Scope) -> Grant {
        self.grants.get(&scope).copied().unwrap_or(Grant::NotGranted)
    }

    /// Granted now, with once-grant expiry re-checked at call time.
    #[must_use]
    pub fn is_granted_at(&self, scope: Scope, now: DateTime<Utc>) -> bool {
        self.grant(scope).is_granted()
            && self
                .once_expiries
                .get(&scope)
                .is_none_or(|expires_at| *expires_at > now)
    }
}

/// One side of an invocation.
#[derive(Debug, Clone, Copy)]
pub struct InvocationParty<'a> {
    pub agent_id: &'a str,
    pub origin: &'a str,
    pub exec_ctx: Option<&'a str>,
}

/// Ephemeral, per-invocation view handed to the callee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContext {
    pub invoker_agent_id: String,
    pub invoker_origin: String,
    pub target_agent_id: String,
    pub target_origin: String,
    pub effective: EffectivePermissions,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl InvocationContext {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    #[must_use]
    pub fn is_cross_origin(&self) -> bool {
        self.invoker_origin != self.target_origin
    }

    #[must_use]
    pub fn check_permission(&self, scope: Scope) -> bool {
        let now = Utc::now();
        !self.expires_at.is_some_and(|at| at <= now) && self.effective.is_granted_at(scope, now)
    }

    #[must_use]
    pub fn check_tool_access(&self, tool: &str) -> bool {
        self.check_permission(Scope::CallTool) && self.effective.allowed_tools.contains(tool)
    }
}

#[must_use]
pub fn effective(
    store: &PermissionStore,
    invoker_origin: &str,
    invoker_ctx: Option<&str>,
    target_origin: &str,
    target_ctx: Option<&str>,
) -> EffectivePermissions {
    let invoker = store.resolve(invoker_origin, invoker_ctx);
    let target = store.resolve(target_origin, target_ctx);
    intersect(&invoker, &target)
}

fn intersect(invoker: &ResolvedPermissions, target: &ResolvedPermissions) -> EffectivePermissions {
    let mut effective = EffectivePermissions::default();

    for scope in Scope::all() {
        let left = invoker.grants.get(&scope).copied().unwrap_or(Grant::NotGranted);
        let right = target.grants.get(&scope).copied().unwrap_or(Grant::NotGranted);
        let grant = left.min(right);
        effective.grants.insert(scope, grant);

        if grant.is_granted() {
            let expiry = [
                invoker.once_expiries.get(&scope),
                target.once_expiries.get(&scope),
            ]
            .into_iter()
            .flatten()
            .min()
            .copied();
            if let Some(expiry) = expiry {
                effective.once_expiries.insert(scope, expiry);
            }
        }
    }

    effective.allowed_tools = invoker
        .allowed_tools
        .intersection(&target.allowed_tools)
        .cloned()
        .collect();
    effective
}

/// Gate an invocation and build the context the callee consults.
///
/// The invoker must itself hold every required scope; a cross-origin call
/// additionally needs `cross-origin-messaging` on the invoker.
pub fn check_invocation(
    store: &PermissionStore,
    invoker: InvocationParty<'_>,
    target: InvocationParty<'_>,
    required_scopes: &[Scope],
    ttl: Option<Duration>,
) -> Result<InvocationContext> {
    let invoker_check = store.check(invoker.origin, required_scopes, invoker.exec_ctx);
    if !invoker_check.granted {
        let mut lacking = invoker_check.denied;
        lacking.extend(invoker_check.missing);
        return Err(KernelError::PermissionDenied(format!(
            "agent {} cannot delegate scopes it does not hold: {}",
            invoker.agent_id,
            join_scopes(&lacking)
        )));
    }

    if invoker.origin != target.origin
        && !store
            .grant_for(invoker.origin, Scope::CrossOriginMessaging, invoker.exec_ctx)
            .is_granted()
    {
        return Err(KernelError::PermissionDenied(format!(
            "origin {} lacks {} to reach {}",
            invoker.origin,
            Scope::CrossOriginMessaging,
            target.origin
        )));
    }

    let created_at = Utc::now();
    let expires_at = ttl
        .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .map(|ttl| created_at + ttl);

    Ok(InvocationContext {
        invoker_agent_id: invoker.agent_id.to_string(),
        invoker_origin: invoker.origin.to_string(),
        target_agent_id: target.agent_id.to_string(),
        target_origin: target.origin.to_string(),
        effective: effective(
            store,
            invoker.origin,
            invoker.exec_ctx,
            target.origin,
            target.exec_ctx,
        ),
        created_at,
        expires_at,
    })
}

fn join_scopes(scopes: &[Scope]) -> String {
    scopes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
