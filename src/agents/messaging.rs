//! Message delivery, invocation and event broadcast between agents.
//!
//! Handler tables are keyed by agent id. Handlers are cloned out of the table
//! before they run, so a slow handler never blocks registration or delivery
//! to other agents.

use super::registry::AgentRegistry;
use super::remote::RemoteAgentClient;
use super::types::{
    Agent, AgentEvent, AgentMessage, AgentStatus, BroadcastResult, InvocationRequest,
    InvocationResponse, UsageKind,
};
use crate::error::{KernelError, Result};
use crate::permissions::{
    InvocationContext, InvocationParty, PermissionStore, Scope, check_invocation,
};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

type MessageHandler = Arc<dyn Fn(AgentMessage) -> HandlerFuture<()> + Send + Sync>;
type InvocationHandler =
    Arc<dyn Fn(InvocationRequest, InvocationContext) -> HandlerFuture<Value> + Send + Sync>;
type EventHandler = Arc<dyn Fn(AgentEvent) -> HandlerFuture<()> + Send + Sync>;

#[derive(Default)]
struct HandlerTables {
    message: HashMap<String, MessageHandler>,
    invocation: HashMap<String, InvocationHandler>,
    event: HashMap<String, EventHandler>,
    /// Event type to subscribed agent ids.
    subscriptions: HashMap<String, BTreeSet<String>>,
}

pub struct MessagingEngine {
    registry: Arc<AgentRegistry>,
    permissions: Arc<PermissionStore>,
    remote: RemoteAgentClient,
    tables: Mutex<HandlerTables>,
    default_timeout: Duration,
}

impl MessagingEngine {
    pub fn new(
        registry: Arc<AgentRegistry>,
        permissions: Arc<PermissionStore>,
        remote: RemoteAgentClient,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            permissions,
            remote,
            tables: Mutex::new(HandlerTables::default()),
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn register_message_handler<F, Fut>(&self, agent_id: &str, handler: F) -> Result<()>
    where
        F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.require(agent_id)?;
        let handler: MessageHandler = Arc::new(move |message: AgentMessage| -> HandlerFuture<()> {
            Box::pin(handler(message))
        });
        self.lock().message.insert(agent_id.to_string(), handler);
        Ok(())
    }

    pub fn register_invocation_handler<F, Fut>(&self, agent_id: &str, handler: F) -> Result<()>
    where
        F: Fn(InvocationRequest, InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.registry.require(agent_id)?;
        let handler: InvocationHandler = Arc::new(
            move |request: InvocationRequest, context: InvocationContext| -> HandlerFuture<Value> {
                Box::pin(handler(request, context))
            },
        );
        self.lock().invocation.insert(agent_id.to_string(), handler);
        Ok(())
    }

    pub fn register_event_handler<F, Fut>(&self, agent_id: &str, handler: F) -> Result<()>
    where
        F: Fn(AgentEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.require(agent_id)?;
        let handler: EventHandler =
            Arc::new(move |event: AgentEvent| -> HandlerFuture<()> { Box::pin(handler(event)) });
        self.lock().event.insert(agent_id.to_string(), handler);
        Ok(())
    }

    pub fn subscribe(&self, agent_id: &str, event_type: &str) -> Result<()> {
        self.registry.require(agent_id)?;
        self.lock()
            .subscriptions
            .entry(event_type.to_string())
            .or_default()
            .insert(agent_id.to_string());
        Ok(())
    }

    pub fn unsubscribe(&self, agent_id: &str, event_type: &str) -> bool {
        let mut tables = self.lock();
        let Some(subscribers) = tables.subscriptions.get_mut(event_type) else {
            return false;
        };
        let removed = subscribers.remove(agent_id);
        if subscribers.is_empty() {
            tables.subscriptions.remove(event_type);
        }
        removed
    }

    #[must_use]
    pub fn subscribers(&self, event_type: &str) -> Vec<String> {
        self.lock()
            .subscriptions
            .get(event_type)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every handler and subscription of one agent.
    pub fn remove_agent(&self, agent_id: &str) {
        let mut tables = self.lock();
        tables.message.remove(agent_id);
        tables.invocation.remove(agent_id);
        tables.event.remove(agent_id);
        tables.subscriptions.retain(|_, subscribers| {
            subscribers.remove(agent_id);
            !subscribers.is_empty()
        });
    }

    /// Deliver `payload` to `to` and wait for its handler.
    pub async fn send_message(
        &self,
        from: &str,
        to: &str,
        payload: Value,
        from_origin: &str,
    ) -> Result<AgentMessage> {
        let sender = self.owned_agent(from, from_origin)?;
        let recipient = self.registry.require(to)?;
        if !recipient.accepts_messages || recipient.status != AgentStatus::Active {
            return Err(KernelError::NotAcceptingMessages(to.to_string()));
        }
        self.require_cross_origin(&sender, &recipient)?;

        let message = AgentMessage {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            from_origin: from_origin.to_string(),
            payload,
            sent_at: Utc::now(),
        };

        if let Some(endpoint) = recipient.kind.endpoint() {
            self.remote.send_message(endpoint, &message).await?;
        } else {
            let handler = self
                .lock()
                .message
                .get(to)
                .cloned()
                .ok_or_else(|| KernelError::NotAcceptingMessages(to.to_string()))?;
            handler(message.clone()).await.map_err(|error| {
                KernelError::InvocationFailed(format!("message handler of {to} failed: {error:#}"))
            })?;
        }

        self.registry.record_usage(from, UsageKind::MessageSent);
        self.registry.touch(to);
        tracing::debug!(from, to, message_id = %message.id, "message delivered");
        Ok(message)
    }

    pub async fn invoke(
        &self,
        to: &str,
        request: InvocationRequest,
        from: &str,
        from_origin: &str,
        timeout: Option<Duration>,
    ) -> InvocationResponse {
        self.invoke_with_cancel(to, request, from, from_origin, timeout, &CancellationToken::new())
            .await
    }

    /// Invoke `to` and race its handler against `timeout` and `cancel`.
    ///
    /// Whichever settles first decides the response. A handler that finishes
    /// after the timeout or the cancellation keeps running; its result is
    /// discarded.
    pub async fn invoke_with_cancel(
        &self,
        to: &str,
        request: InvocationRequest,
        from: &str,
        from_origin: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> InvocationResponse {
        let started = Instant::now();
        let timeout = timeout.unwrap_or(self.default_timeout);
        let outcome = self
            .dispatch(to, request, from, from_origin, timeout, cancel)
            .await;
        if let Err(error) = &outcome {
            tracing::debug!(from, to, %error, "invocation failed");
        }
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        InvocationResponse::from_result(to, outcome, elapsed)
    }

    async fn dispatch(
        &self,
        to: &str,
        request: InvocationRequest,
        from: &str,
        from_origin: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if cancel.is_cancelled() {
            return Err(KernelError::Cancelled);
        }
        let invoker = self.owned_agent(from, from_origin)?;
        let target = self.registry.require(to)?;
        if !target.accepts_invocations || target.status != AgentStatus::Active {
            return Err(KernelError::NotAcceptingInvocations(to.to_string()));
        }

        let context = check_invocation(
            &self.permissions,
            party(&invoker),
            party(&target),
            &request.required_scopes,
            Some(timeout),
        )?;

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let timed_out = || KernelError::InvocationTimeout {
            agent_id: to.to_string(),
            timeout_ms,
        };

        if let Some(endpoint) = target.kind.endpoint() {
            self.count_invocation(from, to);
            return tokio::select! {
                () = cancel.cancelled() => Err(KernelError::Cancelled),
                outcome = self.remote.invoke(endpoint, from, from_origin, &request, timeout) => {
                    match outcome {
                        Err(KernelError::InvocationTimeout { .. }) => Err(timed_out()),
                        other => other,
                    }
                }
            };
        }

        let handler = self
            .lock()
            .invocation
            .get(to)
            .cloned()
            .ok_or_else(|| KernelError::NotAcceptingInvocations(to.to_string()))?;
        self.count_invocation(from, to);

        let mut running = tokio::spawn(handler(request, context));
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!(from, to, "invocation cancelled");
                Err(KernelError::Cancelled)
            }
            joined = &mut running => match joined {
                Ok(Ok(value)) => {
                    self.registry.touch(to);
                    Ok(value)
                }
                Ok(Err(error)) => Err(KernelError::InvocationFailed(format!("{error:#}"))),
                Err(error) => Err(KernelError::InvocationFailed(format!(
                    "handler of {to} panicked: {error}"
                ))),
            },
            () = tokio::time::sleep(timeout) => {
                tracing::warn!(from, to, timeout_ms, "invocation timed out");
                Err(timed_out())
            }
        }
    }

    /// Deliver an event to every subscriber except the sender.
    ///
    /// Subscribers in another origin are skipped unless the sender's origin
    /// holds `cross-origin-messaging`. A handler error or panic counts as
    /// `failed`.
    pub async fn broadcast(
        &self,
        from: &str,
        event_type: &str,
        data: Value,
    ) -> Result<BroadcastResult> {
        let sender = self.registry.require(from)?;
        let cross_origin = self
            .permissions
            .grant_for(&sender.origin, Scope::CrossOriginMessaging, sender.exec_ctx.as_deref())
            .is_granted();
        let event = AgentEvent {
            event_type: event_type.to_string(),
            from: from.to_string(),
            data,
            emitted_at: Utc::now(),
        };

        let targets: Vec<(Agent, Option<EventHandler>)> = {
            let tables = self.lock();
            tables
                .subscriptions
                .get(event_type)
                .into_iter()
                .flatten()
                .filter(|id| id.as_str() != from)
                .filter_map(|id| self.registry.get(id))
                .filter(|agent| agent.origin == sender.origin || cross_origin)
                .map(|agent| {
                    let handler = tables.event.get(&agent.id).cloned();
                    (agent, handler)
                })
                .collect()
        };

        let deliveries = targets.into_iter().map(|(agent, handler)| {
            let event = event.clone();
            let from_origin = sender.origin.clone();
            async move {
                if let Some(endpoint) = agent.kind.endpoint() {
                    let message = AgentMessage {
                        id: uuid::Uuid::new_v4().to_string(),
                        from: event.from.clone(),
                        to: agent.id.clone(),
                        from_origin,
                        payload: json!({"event": event.event_type, "data": event.data}),
                        sent_at: event.emitted_at,
                    };
                    return self.remote.send_message(endpoint, &message).await.is_ok();
                }
                let Some(handler) = handler else {
                    return false;
                };
                match tokio::spawn(handler(event)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(error)) => {
                        tracing::debug!(agent_id = %agent.id, %error, "event handler failed");
                        false
                    }
                    Err(error) => {
                        tracing::warn!(agent_id = %agent.id, %error, "event handler panicked");
                        false
                    }
                }
            }
        });

        let mut result = BroadcastResult::default();
        for delivered in futures_util::future::join_all(deliveries).await {
            if delivered {
                result.delivered += 1;
            } else {
                result.failed += 1;
            }
        }
        tracing::debug!(
            from,
            event_type,
            delivered = result.delivered,
            failed = result.failed,
            "broadcast finished"
        );
        Ok(result)
    }

    fn owned_agent(&self, agent_id: &str, origin: &str) -> Result<Agent> {
        let agent = self.registry.require(agent_id)?;
        if agent.origin != origin {
            return Err(KernelError::PermissionDenied(format!(
                "agent {agent_id} does not belong to {origin}"
            )));
        }
        Ok(agent)
    }

    fn require_cross_origin(&self, sender: &Agent, recipient: &Agent) -> Result<()> {
        if sender.origin == recipient.origin {
            return Ok(());
        }
        let granted = self
            .permissions
            .grant_for(&sender.origin, Scope::CrossOriginMessaging, sender.exec_ctx.as_deref())
            .is_granted();
        if granted {
            Ok(())
        } else {
            Err(KernelError::PermissionDenied(format!(
                "origin {} lacks {} to reach {}",
                sender.origin,
                Scope::CrossOriginMessaging,
                recipient.origin
            )))
        }
    }

    fn count_invocation(&self, from: &str, to: &str) {
        self.registry.record_usage(from, UsageKind::InvocationMade);
        self.registry.record_usage(to, UsageKind::InvocationReceived);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HandlerTables> {
        self.tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn party(agent: &Agent) -> InvocationParty<'_> {
    InvocationParty {
        agent_id: &agent.id,
        origin: &agent.origin,
        exec_ctx: agent.exec_ctx.as_deref(),
    }
}
