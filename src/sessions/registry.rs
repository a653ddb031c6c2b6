use super::types::{
    BrowserCapability, ImplicitSessionOptions, LlmCapability, Session, SessionCapabilities,
    SessionKind, SessionMessage, SessionRequest, SessionStatus, SessionUsage, ToolCapability,
};
use crate::error::{KernelError, Result};
use crate::permissions::{PermissionStore, Scope};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionRegistryConfig {
    pub idle_timeout: Duration,
    pub terminated_grace: Duration,
    pub max_history: usize,
}

impl Default for SessionRegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60 * 60),
            terminated_grace: Duration::from_secs(5 * 60),
            max_history: 200,
        }
    }
}

/// What one [`SessionRegistry::sweep`] pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub idle: usize,
    pub removed: usize,
}

/// In-memory session table.
///
/// Capabilities are computed from the permission store once, at creation,
/// and only ever narrowed afterwards.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    permissions: Arc<PermissionStore>,
    config: SessionRegistryConfig,
}

impl SessionRegistry {
    pub fn new(permissions: Arc<PermissionStore>, config: SessionRegistryConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            permissions,
            config,
        }
    }

    pub fn create_implicit(
        &self,
        origin: &str,
        options: ImplicitSessionOptions,
        exec_ctx: Option<&str>,
    ) -> Session {
        let llm_allowed = self
            .permissions
            .grant_for(origin, Scope::PromptModel, exec_ctx)
            .is_granted();

        let capabilities = SessionCapabilities {
            llm: LlmCapability {
                allowed: llm_allowed,
                provider: options.provider,
                model: options.model,
            },
            ..SessionCapabilities::default()
        };

        let session = self.insert(SessionKind::Implicit, origin, exec_ctx, None, capabilities);
        tracing::info!(
            session_id = %session.id,
            origin,
            llm = llm_allowed,
            "implicit session created"
        );
        session
    }

    /// Create a session whose capabilities are the intersection of `request`
    /// with what `origin` currently holds. Requests the origin cannot back are
    /// dropped, not rejected.
    pub fn create_explicit(
        &self,
        origin: &str,
        request: SessionRequest,
        exec_ctx: Option<&str>,
    ) -> Result<Session> {
        if let Some(expires_at) = request.limits.and_then(|limits| limits.expires_at)
            && expires_at <= Utc::now()
        {
            return Err(KernelError::InvalidRequest(format!(
                "session expiry {expires_at} is in the past"
            )));
        }

        let resolved = self.permissions.resolve(origin, exec_ctx);
        let holds = |scope: Scope| {
            resolved
                .grants
                .get(&scope)
                .is_some_and(|grant| grant.is_granted())
        };

        let llm = match request.llm {
            Some(options) => LlmCapability {
                allowed: holds(Scope::PromptModel),
                provider: options.provider,
                model: options.model,
            },
            None => LlmCapability::default(),
        };

        let allowed_tools: BTreeSet<String> = if holds(Scope::CallTool) {
            request
                .tools
                .iter()
                .filter(|tool| resolved.allowed_tools.contains(tool.as_str()))
                .cloned()
                .collect()
        } else {
            BTreeSet::new()
        };
        let dropped = request.tools.len() - allowed_tools.len();

        let capabilities = SessionCapabilities {
            llm,
            tools: ToolCapability {
                allowed: !allowed_tools.is_empty(),
                allowed_tools,
            },
            browser: BrowserCapability {
                read: request.browser.read && holds(Scope::ReadActivePage),
                interact: request.browser.interact && holds(Scope::InteractActivePage),
                screenshot: request.browser.screenshot && holds(Scope::ScreenshotActivePage),
            },
            limits: request.limits,
        };

        let session = self.insert(
            SessionKind::Explicit,
            origin,
            exec_ctx,
            request.name,
            capabilities,
        );
        tracing::info!(
            session_id = %session.id,
            origin,
            tools = session.capabilities.tools.allowed_tools.len(),
            dropped_tools = dropped,
            "explicit session created"
        );
        Ok(session)
    }

    /// Look up a live session on behalf of `origin`.
    ///
    /// A session past its `expires_at` is terminated here and reported as
    /// not found.
    pub fn validate(&self, session_id: &str, origin: &str) -> Result<Session> {
        let now = Utc::now();
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .filter(|session| session.status != SessionStatus::Terminated)
            .ok_or_else(|| KernelError::SessionNotFound(session_id.to_string()))?;

        if session.origin != origin {
            return Err(KernelError::PermissionDenied(format!(
                "session {session_id} belongs to another origin"
            )));
        }
        if session.is_expired(now) {
            mark_terminated(session, now);
            tracing::info!(session_id, "session expired");
            return Err(KernelError::SessionNotFound(format!("{session_id} (expired)")));
        }
        if session.status == SessionStatus::Suspended {
            return Err(KernelError::InvalidRequest(format!(
                "session {session_id} is suspended"
            )));
        }
        Ok(session.clone())
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.lock().get(session_id).cloned()
    }

    /// Count one tool call against the session budget.
    ///
    /// Returns `false`, leaving the session untouched, when the session is not
    /// active or its `max_tool_calls` is already used up.
    pub fn record_tool_call(&self, session_id: &str) -> bool {
        self.with_active(session_id, |session, now| {
            if session.tool_budget_exhausted() {
                return false;
            }
            session.usage.tool_call_count += 1;
            session.last_active_at = now;
            true
        })
        .unwrap_or(false)
    }

    pub fn record_prompt(&self, session_id: &str) -> bool {
        self.with_active(session_id, |session, now| {
            session.usage.prompt_count += 1;
            session.last_active_at = now;
            true
        })
        .unwrap_or(false)
    }

    pub fn append_history(&self, session_id: &str, message: SessionMessage) -> Result<()> {
        let max_history = self.config.max_history;
        self.with_active(session_id, |session, now| {
            session.history.push(message);
            if max_history > 0 && session.history.len() > max_history {
                let excess = session.history.len() - max_history;
                session.history.drain(..excess);
            }
            session.last_active_at = now;
        })
        .ok_or_else(|| KernelError::SessionNotFound(session_id.to_string()))
    }

    /// Whether `tool` may be called in this session right now, budget included.
    #[must_use]
    pub fn can_use_tool(&self, session_id: &str, tool: &str) -> bool {
        let now = Utc::now();
        self.lock().get(session_id).is_some_and(|session| {
            session.status == SessionStatus::Active
                && !session.is_expired(now)
                && session.capabilities.tools.allowed
                && session.capabilities.tools.allowed_tools.contains(tool)
                && !session.tool_budget_exhausted()
        })
    }

    pub fn suspend(&self, session_id: &str, origin: &str) -> Result<()> {
        self.transition(session_id, origin, |session, _| match session.status {
            SessionStatus::Active | SessionStatus::Suspended => {
                session.status = SessionStatus::Suspended;
                Ok(())
            }
            SessionStatus::Terminated => Err(KernelError::SessionNotFound(session.id.clone())),
        })
    }

    pub fn resume(&self, session_id: &str, origin: &str) -> Result<()> {
        self.transition(session_id, origin, |session, now| {
            if session.status == SessionStatus::Terminated || session.is_expired(now) {
                mark_terminated(session, now);
                return Err(KernelError::SessionNotFound(session.id.clone()));
            }
            session.status = SessionStatus::Active;
            session.last_active_at = now;
            Ok(())
        })
    }

    pub fn terminate(&self, session_id: &str, origin: &str) -> Result<()> {
        self.transition(session_id, origin, |session, now| {
            if session.status == SessionStatus::Terminated {
                return Err(KernelError::SessionNotFound(session.id.clone()));
            }
            mark_terminated(session, now);
            Ok(())
        })?;
        tracing::info!(session_id, origin, "session terminated");
        Ok(())
    }

    /// Live sessions of one origin, oldest first.
    #[must_use]
    pub fn list_for_origin(&self, origin: &str) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .lock()
            .values()
            .filter(|session| {
                session.origin == origin && session.status != SessionStatus::Terminated
            })
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Terminate every live session bound to `exec_ctx`. Returns their ids.
    pub fn cleanup_by_exec_ctx(&self, exec_ctx: &str) -> Vec<String> {
        let now = Utc::now();
        let mut terminated = Vec::new();
        for session in self.lock().values_mut() {
            if session.exec_ctx.as_deref() == Some(exec_ctx)
                && session.status != SessionStatus::Terminated
            {
                mark_terminated(session, now);
                terminated.push(session.id.clone());
            }
        }
        terminated.sort();
        if !terminated.is_empty() {
            tracing::info!(exec_ctx, count = terminated.len(), "sessions cleaned up");
        }
        terminated
    }

    /// Terminate expired and idle sessions, and drop terminated ones whose
    /// grace window has passed.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let idle_timeout = to_chrono(self.config.idle_timeout);
        let grace = to_chrono(self.config.terminated_grace);
        let mut report = SweepReport::default();
        let mut sessions = self.lock();

        for session in sessions.values_mut() {
            if session.status == SessionStatus::Terminated {
                continue;
            }
            if session.is_expired(now) {
                mark_terminated(session, now);
                report.expired += 1;
            } else if session.last_active_at + idle_timeout <= now {
                mark_terminated(session, now);
                report.idle += 1;
            }
        }

        let before = sessions.len();
        sessions.retain(|_, session| {
            session
                .terminated_at
                .is_none_or(|terminated_at| terminated_at + grace > now)
        });
        report.removed = before - sessions.len();

        if report != SweepReport::default() {
            tracing::debug!(
                expired = report.expired,
                idle = report.idle,
                removed = report.removed,
                "session sweep"
            );
        }
        report
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn insert(
        &self,
        kind: SessionKind,
        origin: &str,
        exec_ctx: Option<&str>,
        name: Option<String>,
        capabilities: SessionCapabilities,
    ) -> Session {
        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            origin: origin.to_string(),
            exec_ctx: exec_ctx.map(str::to_string),
            name,
            status: SessionStatus::Active,
            capabilities,
            history: Vec::new(),
            usage: SessionUsage::default(),
            created_at: now,
            last_active_at: now,
            terminated_at: None,
        };
        self.lock().insert(session.id.clone(), session.clone());
        session
    }

    fn with_active<T>(
        &self,
        session_id: &str,
        apply: impl FnOnce(&mut Session, DateTime<Utc>) -> T,
    ) -> Option<T> {
        let now = Utc::now();
        let mut sessions = self.lock();
        let session = sessions.get_mut(session_id)?;
        if session.status != SessionStatus::Active {
            return None;
        }
        if session.is_expired(now) {
            mark_terminated(session, now);
            return None;
        }
        Some(apply(session, now))
    }

    fn transition(
        &self,
        session_id: &str,
        origin: &str,
        apply: impl FnOnce(&mut Session, DateTime<Utc>) -> Result<()>,
    ) -> Result<()> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| KernelError::SessionNotFound(session_id.to_string()))?;
        if session.origin != origin {
            return Err(KernelError::PermissionDenied(format!(
                "session {session_id} belongs to another origin"
            )));
        }
        apply(session, Utc::now())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn mark_terminated(session: &mut Session, now: DateTime<Utc>) {
    session.status = SessionStatus::Terminated;
    session.terminated_at.get_or_insert(now);
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
