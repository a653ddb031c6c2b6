use super::types::{
    Agent, AgentKind, AgentOptions, AgentQuery, AgentStatus, AgentSummary, AgentUsage, UsageKind,
};
use crate::error::{KernelError, Result};
use crate::permissions::{PermissionStore, Scope};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// In-memory agent table. Volatile by design: agents re-register after a
/// restart.
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, Agent>>,
    permissions: Arc<PermissionStore>,
}

impl AgentRegistry {
    pub fn new(permissions: Arc<PermissionStore>) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            permissions,
        }
    }

    pub fn register(
        &self,
        origin: &str,
        options: AgentOptions,
        exec_ctx: Option<&str>,
    ) -> Result<Agent> {
        let agent = self.insert(origin, options, exec_ctx, AgentKind::Local)?;
        tracing::info!(agent_id = %agent.id, origin, name = %agent.name, "agent registered");
        Ok(agent)
    }

    pub fn register_remote(
        &self,
        origin: &str,
        options: AgentOptions,
        endpoint: &str,
    ) -> Result<Agent> {
        let parsed = url::Url::parse(endpoint).map_err(|error| {
            KernelError::InvalidRequest(format!("invalid endpoint {endpoint}: {error}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(KernelError::InvalidRequest(format!(
                "remote agent endpoint must be http(s): {endpoint}"
            )));
        }

        let agent = self.insert(
            origin,
            options,
            None,
            AgentKind::Remote {
                endpoint: endpoint.trim_end_matches('/').to_string(),
            },
        )?;
        tracing::info!(agent_id = %agent.id, origin, endpoint, "remote agent registered");
        Ok(agent)
    }

    /// Remove an agent. Only its owning origin may do so.
    pub fn unregister(&self, agent_id: &str, origin: &str) -> Result<Agent> {
        let mut agents = self.lock();
        let owner = agents
            .get(agent_id)
            .map(|agent| agent.origin.clone())
            .ok_or_else(|| KernelError::AgentNotFound(agent_id.to_string()))?;
        if owner != origin {
            return Err(KernelError::PermissionDenied(format!(
                "agent {agent_id} is owned by another origin"
            )));
        }
        let mut removed = agents
            .remove(agent_id)
            .ok_or_else(|| KernelError::AgentNotFound(agent_id.to_string()))?;
        removed.status = AgentStatus::Terminated;
        tracing::info!(agent_id, origin, "agent unregistered");
        Ok(removed)
    }

    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<Agent> {
        self.lock().get(agent_id).cloned()
    }

    pub fn require(&self, agent_id: &str) -> Result<Agent> {
        self.get(agent_id)
            .ok_or_else(|| KernelError::AgentNotFound(agent_id.to_string()))
    }

    /// Agents visible to `origin` that match `query`.
    ///
    /// Same-origin local agents are always visible. Cross-origin local agents
    /// need `cross-origin-messaging`. Remote agents need
    /// `register-remote-agent` and must currently be active.
    pub fn discover(
        &self,
        origin: &str,
        query: &AgentQuery,
        exec_ctx: Option<&str>,
    ) -> Vec<AgentSummary> {
        let holds = |scope| self.permissions.grant_for(origin, scope, exec_ctx).is_granted();
        let see_cross = query.include_cross_origin && holds(Scope::CrossOriginMessaging);
        let see_remote = query.include_remote && holds(Scope::RegisterRemoteAgent);
        let name = query.name.as_deref().map(str::to_lowercase);

        let agents = self.lock();
        let mut found: Vec<&Agent> = agents
            .values()
            .filter(|agent| agent.status != AgentStatus::Terminated)
            .filter(|agent| {
                if agent.kind.is_remote() {
                    see_remote && agent.status == AgentStatus::Active
                } else if agent.origin == origin {
                    query.include_same_origin
                } else {
                    see_cross
                }
            })
            .filter(|agent| {
                name.as_deref()
                    .is_none_or(|name| agent.name.to_lowercase().contains(name))
            })
            .filter(|agent| {
                query
                    .capabilities
                    .iter()
                    .all(|capability| agent.capabilities.contains(capability))
            })
            .filter(|agent| {
                query.tags.is_empty() || query.tags.iter().any(|tag| agent.tags.contains(tag))
            })
            .collect();

        found.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        found
            .into_iter()
            .map(|agent| AgentSummary::of(agent, origin))
            .collect()
    }

    pub fn record_usage(&self, agent_id: &str, kind: UsageKind) -> bool {
        self.update(agent_id, |agent| {
            agent.usage.bump(kind);
            agent.last_active_at = Utc::now();
        })
    }

    #[must_use]
    pub fn usage(&self, agent_id: &str) -> Option<AgentUsage> {
        self.lock().get(agent_id).map(|agent| agent.usage)
    }

    pub fn set_status(&self, agent_id: &str, status: AgentStatus) -> bool {
        self.update(agent_id, |agent| {
            if agent.status != status {
                tracing::info!(
                    agent_id = %agent.id,
                    from = ?agent.status,
                    to = ?status,
                    "agent status changed"
                );
            }
            agent.status = status;
        })
    }

    pub fn touch(&self, agent_id: &str) -> bool {
        self.update(agent_id, |agent| agent.last_active_at = Utc::now())
    }

    #[must_use]
    pub fn remote_agents(&self) -> Vec<Agent> {
        self.lock()
            .values()
            .filter(|agent| agent.kind.is_remote())
            .cloned()
            .collect()
    }

    /// Remove every agent registered from `exec_ctx`. Returns removed ids.
    pub fn cleanup_by_exec_ctx(&self, exec_ctx: &str) -> Vec<String> {
        let removed = self.remove_where(|agent| agent.exec_ctx.as_deref() == Some(exec_ctx));
        if !removed.is_empty() {
            tracing::info!(exec_ctx, count = removed.len(), "agents cleaned up");
        }
        removed
    }

    pub fn cleanup_by_origin(&self, origin: &str) -> Vec<String> {
        let removed = self.remove_where(|agent| agent.origin == origin);
        if !removed.is_empty() {
            tracing::info!(origin, count = removed.len(), "agents cleaned up");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn insert(
        &self,
        origin: &str,
        options: AgentOptions,
        exec_ctx: Option<&str>,
        kind: AgentKind,
    ) -> Result<Agent> {
        let name = options.name.trim();
        if name.is_empty() {
            return Err(KernelError::InvalidRequest(
                "agent name must not be empty".to_string(),
            ));
        }
        if origin.trim().is_empty() {
            return Err(KernelError::InvalidRequest(
                "agent origin must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let agent = Agent {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: options.description,
            kind,
            status: AgentStatus::Active,
            origin: origin.to_string(),
            exec_ctx: exec_ctx.map(str::to_string),
            capabilities: clean_set(options.capabilities),
            tags: clean_set(options.tags),
            accepts_invocations: options.accepts_invocations,
            accepts_messages: options.accepts_messages,
            registered_at: now,
            last_active_at: now,
            usage: AgentUsage::default(),
        };
        self.lock().insert(agent.id.clone(), agent.clone());
        Ok(agent)
    }

    fn update(&self, agent_id: &str, apply: impl FnOnce(&mut Agent)) -> bool {
        match self.lock().get_mut(agent_id) {
            Some(agent) => {
                apply(agent);
                true
            }
            None => false,
        }
    }

    fn remove_where(&self, matches: impl Fn(&Agent) -> bool) -> Vec<String> {
        let mut agents = self.lock();
        let mut removed: Vec<String> = agents
            .values()
            .filter(|agent| matches(agent))
            .map(|agent| agent.id.clone())
            .collect();
        for id in &removed {
            agents.remove(id);
        }
        removed.sort();
        removed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Agent>> {
        self.agents
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn clean_set(values: Vec<String>) -> BTreeSet<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}
