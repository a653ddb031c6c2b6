//! Wiring facade over every store.
//!
//! Hosts hand the kernel plain request records and get plain records back.
//! The facade owns the scope gates that sit in front of the registries, so
//! the registries themselves stay free of policy about who may call them.

use crate::agents::{
    Agent, AgentOptions, AgentQuery, AgentRegistry, AgentStatus, AgentSummary, MessagingEngine,
    RemoteAgentClient,
};
use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::llm::{ChatMessage, ChatRequest, ChatResponse, ChatStream, LlmClient, StreamEvent};
use crate::orchestration::{BoundInvoker, Orchestrator};
use crate::permissions::{
    PermissionStore, PromptRequest, PromptSurface, RequestOutcome, Scope, request_permissions,
};
use crate::sessions::{
    ImplicitSessionOptions, MessageRole, Session, SessionMessage, SessionRegistry, SessionRequest,
};
use crate::transport::{ServerManager, ToolDescriptor};
use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One tool call as a host submits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub origin: String,
    #[serde(default)]
    pub exec_ctx: Option<String>,
    /// When set, the session's tool list and budget apply on top of the
    /// origin's grants.
    #[serde(default)]
    pub session_id: Option<String>,
    pub server_id: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Ids released by a cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub sessions: Vec<String>,
    pub agents: Vec<String>,
}

pub struct Kernel {
    config: KernelConfig,
    permissions: Arc<PermissionStore>,
    sessions: Arc<SessionRegistry>,
    agents: Arc<AgentRegistry>,
    messaging: Arc<MessagingEngine>,
    servers: Arc<ServerManager>,
    remote: RemoteAgentClient,
    prompt: Arc<dyn PromptSurface>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl Kernel {
    /// Build every store from `config`. Grants are loaded from disk when
    /// persistence is on. Servers are configured but not connected.
    pub fn new(config: KernelConfig, prompt: Arc<dyn PromptSurface>) -> Self {
        let store_config = config.permission_store_config();
        let permissions = match config.grants_path() {
            Some(path) => PermissionStore::load(&path, store_config),
            None => PermissionStore::in_memory(store_config),
        };
        let servers = ServerManager::from_config(&config);
        Self::from_parts(config, Arc::new(permissions), Arc::new(servers), prompt)
    }

    pub fn from_parts(
        config: KernelConfig,
        permissions: Arc<PermissionStore>,
        servers: Arc<ServerManager>,
        prompt: Arc<dyn PromptSurface>,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new(
            Arc::clone(&permissions),
            config.session_registry_config(),
        ));
        let agents = Arc::new(AgentRegistry::new(Arc::clone(&permissions)));
        let remote =
            RemoteAgentClient::new(Duration::from_millis(config.invocation.remote_timeout_ms));
        let messaging = Arc::new(MessagingEngine::new(
            Arc::clone(&agents),
            Arc::clone(&permissions),
            remote.clone(),
            config.invocation_timeout(),
        ));

        Self {
            config,
            permissions,
            sessions,
            agents,
            messaging,
            servers,
            remote,
            prompt,
            llm: None,
        }
    }

    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn permissions(&self) -> &Arc<PermissionStore> {
        &self.permissions
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn messaging(&self) -> &Arc<MessagingEngine> {
        &self.messaging
    }

    pub fn servers(&self) -> &Arc<ServerManager> {
        &self.servers
    }

    // ── Permissions ─────────────────────────────────────────────────────

    pub async fn request_permissions(
        &self,
        request: &PromptRequest,
        exec_ctx: Option<&str>,
    ) -> Result<RequestOutcome> {
        let outcome =
            request_permissions(&self.permissions, self.prompt.as_ref(), request, exec_ctx).await?;
        tracing::info!(
            origin = %request.origin,
            granted = outcome.granted,
            prompted = outcome.prompted,
            "permission request resolved"
        );
        Ok(outcome)
    }

    fn require_scope(&self, origin: &str, scope: Scope, exec_ctx: Option<&str>) -> Result<()> {
        if self.permissions.grant_for(origin, scope, exec_ctx).is_granted() {
            Ok(())
        } else {
            Err(KernelError::PermissionDenied(format!(
                "{origin} does not hold {scope}"
            )))
        }
    }

    // ── Sessions ────────────────────────────────────────────────────────

    pub fn open_session(
        &self,
        origin: &str,
        request: SessionRequest,
        exec_ctx: Option<&str>,
    ) -> Result<Session> {
        self.sessions.create_explicit(origin, request, exec_ctx)
    }

    pub fn open_implicit_session(
        &self,
        origin: &str,
        options: ImplicitSessionOptions,
        exec_ctx: Option<&str>,
    ) -> Session {
        self.sessions.create_implicit(origin, options, exec_ctx)
    }

    pub fn validate_session(&self, session_id: &str, origin: &str) -> Result<Session> {
        self.sessions.validate(session_id, origin)
    }

    pub fn close_session(&self, session_id: &str, origin: &str) -> Result<()> {
        self.sessions.terminate(session_id, origin)
    }

    /// Send `content` to the model inside a session and record the exchange.
    ///
    /// Both the session's snapshot and the origin's live grant must allow
    /// prompting, so a revoke takes effect on open sessions.
    pub async fn prompt(
        &self,
        session_id: &str,
        origin: &str,
        content: &str,
    ) -> Result<ChatResponse> {
        let (llm, request) = self.begin_prompt(session_id, origin, content)?;
        let response = llm.chat(&request).await.map_err(|error| {
            KernelError::InvocationFailed(format!("{} chat failed: {error:#}", llm.name()))
        })?;
        self.sessions.record_prompt(session_id);
        self.sessions.append_history(
            session_id,
            SessionMessage::new(MessageRole::Assistant, response.content.clone()),
        )?;
        tracing::debug!(session_id, backend = llm.name(), "prompt answered");
        Ok(response)
    }

    /// Streaming variant of [`Self::prompt`]. The assistant reply is
    /// recorded when the backend finishes. A stream dropped early records
    /// only the user turn.
    pub async fn prompt_stream(
        &self,
        session_id: &str,
        origin: &str,
        content: &str,
    ) -> Result<ChatStream> {
        let (llm, request) = self.begin_prompt(session_id, origin, content)?;
        let mut upstream = llm.chat_stream(&request).await.map_err(|error| {
            KernelError::InvocationFailed(format!("{} stream failed: {error:#}", llm.name()))
        })?;

        let sessions = Arc::clone(&self.sessions);
        let session_id = session_id.to_string();
        let stream = async_stream::try_stream! {
            let mut reply = String::new();
            while let Some(event) = upstream.next().await {
                match event? {
                    StreamEvent::Done => break,
                    event => {
                        if let StreamEvent::TextDelta { text } = &event {
                            reply.push_str(text);
                        }
                        yield event;
                    }
                }
            }
            // Recorded before `Done` goes out, since consumers stop there.
            sessions.record_prompt(&session_id);
            sessions.append_history(
                &session_id,
                SessionMessage::new(MessageRole::Assistant, reply),
            )?;
            yield StreamEvent::Done;
        };
        Ok(Box::pin(stream))
    }

    /// Gate a prompt, record the user turn and build the backend request.
    fn begin_prompt(
        &self,
        session_id: &str,
        origin: &str,
        content: &str,
    ) -> Result<(Arc<dyn LlmClient>, ChatRequest)> {
        let llm = self
            .llm
            .clone()
            .ok_or_else(|| KernelError::Config("no LLM backend configured".to_string()))?;
        let session = self.sessions.validate(session_id, origin)?;
        if !session.capabilities.llm.allowed {
            return Err(KernelError::PermissionDenied(format!(
                "session {session_id} may not prompt the model"
            )));
        }
        self.require_scope(origin, Scope::PromptModel, session.exec_ctx.as_deref())?;

        self.sessions
            .append_history(session_id, SessionMessage::new(MessageRole::User, content))?;
        let mut messages: Vec<ChatMessage> =
            session.history.iter().map(ChatMessage::from).collect();
        messages.push(ChatMessage::new(MessageRole::User, content));
        let request = ChatRequest {
            messages,
            tools: None,
            provider: session.capabilities.llm.provider.clone(),
            model: session.capabilities.llm.model.clone(),
        };
        Ok((llm, request))
    }

    // ── Agents ──────────────────────────────────────────────────────────

    pub fn register_agent(
        &self,
        origin: &str,
        options: AgentOptions,
        exec_ctx: Option<&str>,
    ) -> Result<Agent> {
        self.require_scope(origin, Scope::RegisterAgent, exec_ctx)?;
        self.agents.register(origin, options, exec_ctx)
    }

    /// Register the agent served at `endpoint`, described by its `/agent-info`.
    pub async fn register_remote_agent(&self, origin: &str, endpoint: &str) -> Result<Agent> {
        self.require_scope(origin, Scope::RegisterRemoteAgent, None)?;
        let info = self.remote.fetch_info(endpoint).await?;
        self.agents.register_remote(origin, info, endpoint)
    }

    pub fn unregister_agent(&self, agent_id: &str, origin: &str) -> Result<Agent> {
        let agent = self.agents.unregister(agent_id, origin)?;
        self.messaging.remove_agent(agent_id);
        Ok(agent)
    }

    pub fn discover_agents(
        &self,
        origin: &str,
        query: &AgentQuery,
        exec_ctx: Option<&str>,
    ) -> Result<Vec<AgentSummary>> {
        self.require_scope(origin, Scope::DiscoverAgents, exec_ctx)?;
        Ok(self.agents.discover(origin, query, exec_ctx))
    }

    /// Orchestrate as `agent_id`. Only the agent's owning origin may do so.
    pub fn orchestrator(&self, agent_id: &str, origin: &str) -> Result<Orchestrator> {
        let agent = self.agents.require(agent_id)?;
        if agent.origin != origin {
            return Err(KernelError::PermissionDenied(format!(
                "agent {agent_id} is owned by another origin"
            )));
        }
        let invoker = BoundInvoker::new(Arc::clone(&self.messaging), agent_id, origin)
            .with_timeout(self.config.invocation_timeout());
        Ok(Orchestrator::new(Arc::new(invoker)))
    }

    // ── Tools ───────────────────────────────────────────────────────────

    pub async fn list_tools(
        &self,
        origin: &str,
        server_id: &str,
        exec_ctx: Option<&str>,
    ) -> Result<Vec<ToolDescriptor>> {
        self.require_scope(origin, Scope::ListTools, exec_ctx)?;
        self.servers.list_tools(server_id).await
    }

    /// Call a tool after the origin, and the session when given, allow it.
    ///
    /// A session call is counted before dispatch, so a call that fails at
    /// the server still uses budget.
    pub async fn call_tool(&self, request: ToolCallRequest) -> Result<Value> {
        let ToolCallRequest {
            origin,
            exec_ctx,
            session_id,
            server_id,
            tool,
            arguments,
        } = request;

        let exec_ctx = match &session_id {
            Some(session_id) => {
                let session = self.sessions.validate(session_id, &origin)?;
                let tools = &session.capabilities.tools;
                if !tools.allowed || !tools.allowed_tools.contains(&tool) {
                    return Err(KernelError::PermissionDenied(format!(
                        "tool {tool} is not allowed in session {session_id}"
                    )));
                }
                session.exec_ctx.or(exec_ctx)
            }
            None => exec_ctx,
        };
        if !self
            .permissions
            .is_tool_allowed(&origin, &tool, exec_ctx.as_deref())
        {
            return Err(KernelError::PermissionDenied(format!(
                "{origin} may not call tool {tool}"
            )));
        }
        if let Some(session_id) = &session_id
            && !self.sessions.record_tool_call(session_id)
        {
            return Err(KernelError::BudgetExceeded(format!(
                "session {session_id} has no tool calls left"
            )));
        }

        tracing::debug!(%origin, %server_id, %tool, "calling tool");
        self.servers.call_tool(&server_id, &tool, arguments).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Release everything bound to one execution context.
    pub fn cleanup_exec_ctx(&self, exec_ctx: &str) -> CleanupReport {
        let agents = self.agents.cleanup_by_exec_ctx(exec_ctx);
        for agent_id in &agents {
            self.messaging.remove_agent(agent_id);
        }
        CleanupReport {
            sessions: self.sessions.cleanup_by_exec_ctx(exec_ctx),
            agents,
        }
    }

    /// Release every agent and session of `origin`. Grants are untouched.
    pub fn cleanup_origin(&self, origin: &str) -> CleanupReport {
        let agents = self.agents.cleanup_by_origin(origin);
        for agent_id in &agents {
            self.messaging.remove_agent(agent_id);
        }
        let sessions = self
            .sessions
            .list_for_origin(origin)
            .into_iter()
            .filter(|session| self.sessions.terminate(&session.id, origin).is_ok())
            .map(|session| session.id)
            .collect();
        CleanupReport { sessions, agents }
    }

    /// Health-check every remote agent. Unreachable agents are suspended and
    /// recovered ones reactivated. Returns how many changed status.
    pub async fn check_remote_health(&self) -> usize {
        let mut changed = 0;
        for agent in self.agents.remote_agents() {
            let Some(endpoint) = agent.kind.endpoint() else {
                continue;
            };
            let healthy = self.remote.health(endpoint).await;
            let next = match (agent.status, healthy) {
                (AgentStatus::Active, false) => AgentStatus::Suspended,
                (AgentStatus::Suspended, true) => AgentStatus::Active,
                _ => continue,
            };
            if self.agents.set_status(&agent.id, next) {
                tracing::info!(
                    agent_id = %agent.id,
                    endpoint,
                    status = ?next,
                    "remote agent status changed"
                );
                changed += 1;
            }
        }
        changed
    }

    /// Run the periodic sweeps until `shutdown` fires.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let kernel = Arc::clone(self);
        tokio::spawn(async move {
            let mut grants = tokio::time::interval(interval_secs(
                kernel.config.permissions.sweep_interval_secs,
            ));
            let mut sessions =
                tokio::time::interval(interval_secs(kernel.config.sessions.sweep_interval_secs));
            let mut health = tokio::time::interval(interval_secs(
                kernel.config.invocation.health_check_interval_secs,
            ));

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = grants.tick() => {
                        let swept = kernel.permissions.sweep_expired();
                        if swept > 0 {
                            tracing::debug!(swept, "expired once-grants swept");
                        }
                    }
                    _ = sessions.tick() => {
                        let report = kernel.sessions.sweep(Utc::now());
                        if report.expired + report.idle + report.removed > 0 {
                            tracing::debug!(?report, "sessions swept");
                        }
                    }
                    _ = health.tick() => {
                        kernel.check_remote_health().await;
                    }
                }
            }
            tracing::info!("kernel maintenance stopped");
        })
    }
}

fn interval_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}
