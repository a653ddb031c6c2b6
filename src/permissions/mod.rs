//! Per-origin capability grants.
//!
//! An origin is granted [`Scope`]s with a [`Grant`] disposition. The store is
//! the single source of truth consulted by sessions, agent registration,
//! invocation and tool calls.

pub mod cli;
pub mod inheritance;
pub mod prompt;
pub mod storage;
pub mod store;

pub use cli::CliPromptSurface;
pub use inheritance::{
    EffectivePermissions, InvocationContext, InvocationParty, check_invocation, effective,
};
pub use prompt::{
    AutoDenyPrompt, PromptOutcome, PromptRequest, PromptSurface, RequestOutcome,
    request_permissions,
};
pub use storage::{GrantStorage, TomlGrantStorage};
pub use store::{PermissionStore, PermissionStoreConfig, ResolvedPermissions};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Atomic named capability. There is no hierarchy between scopes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Scope {
    PromptModel,
    ListModels,
    ListTools,
    CallTool,
    ReadActivePage,
    InteractActivePage,
    ScreenshotActivePage,
    RegisterAgent,
    DiscoverAgents,
    InvokeAgent,
    MessageAgent,
    CrossOriginMessaging,
    RegisterRemoteAgent,
    WebFetch,
}

impl Scope {
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }
}

/// Disposition of a scope for an origin.
///
/// Variant order is restrictiveness order: `Denied < NotGranted < GrantedOnce
/// < GrantedAlways`. Intersections take the minimum.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Grant {
    Denied,
    NotGranted,
    GrantedOnce,
    GrantedAlways,
}

impl Grant {
    #[must_use]
    pub fn is_granted(self) -> bool {
        matches!(self, Self::GrantedOnce | Self::GrantedAlways)
    }
}

/// The two kinds of positive grant a user can hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum GrantKind {
    Once,
    Always,
}

impl From<GrantKind> for Grant {
    fn from(kind: GrantKind) -> Self {
        match kind {
            GrantKind::Once => Self::GrantedOnce,
            GrantKind::Always => Self::GrantedAlways,
        }
    }
}

/// Stored disposition of one scope, including once-grant expiry and binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeGrant {
    pub grant: Grant,
    pub granted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_ctx: Option<String>,
}

impl ScopeGrant {
    /// Resolve against the caller's execution context and the current time.
    ///
    /// A once-grant outside its bound context or past expiry reads as
    /// `NotGranted`; `Denied` and `GrantedAlways` are context-free.
    #[must_use]
    pub fn resolve(&self, exec_ctx: Option<&str>, now: DateTime<Utc>) -> Grant {
        if self.grant != Grant::GrantedOnce {
            return self.grant;
        }
        if self.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Grant::NotGranted;
        }
        match self.exec_ctx.as_deref() {
            Some(bound) if Some(bound) != exec_ctx => Grant::NotGranted,
            _ => Grant::GrantedOnce,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.grant == Grant::GrantedOnce && self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Everything the store knows about one origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginPermissions {
    #[serde(default)]
    pub scopes: BTreeMap<Scope, ScopeGrant>,
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Resolved view of an origin: every scope with its current grant.
pub type PermissionStatus = BTreeMap<Scope, Grant>;

/// Outcome of [`PermissionStore::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub granted: bool,
    pub missing: Vec<Scope>,
    pub denied: Vec<Scope>,
}
