//! Composition patterns built purely on agent invocation.
//!
//! Nothing here touches transports or handler tables directly. Every step
//! goes through an [`AgentInvoker`], which in the kernel is the messaging
//! engine bound to the orchestrating agent's identity.

pub mod parallel;
pub mod pipeline;
pub mod router;
pub mod supervisor;
pub mod template;

pub use parallel::{CombineStrategy, JobResult, ParallelJob, ParallelResult};
pub use pipeline::{OutputTransform, PipelineEvent, PipelineResult, PipelineStep, StepResult};
pub use router::{Route, RouteCondition, RouteResult, RouterConfig};
pub use supervisor::{
    AssignmentStrategy, RetryPolicy, SupervisorConfig, SupervisorResult, SupervisorStats,
    SupervisorTask, TaskAttempt, TaskResult,
};

use crate::agents::{InvocationRequest, MessagingEngine};
use crate::error::Result;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub type InvokeFuture<'a> = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;

/// The one capability orchestration needs: invoke an agent by id.
pub trait AgentInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        agent_id: &'a str,
        request: InvocationRequest,
        cancel: &'a CancellationToken,
    ) -> InvokeFuture<'a>;

    /// Declared capabilities of an agent, used by capability matching.
    fn capabilities(&self, agent_id: &str) -> Option<BTreeSet<String>>;
}

/// Messaging engine acting as one agent of one origin.
pub struct BoundInvoker {
    engine: Arc<MessagingEngine>,
    agent_id: String,
    origin: String,
    timeout: Option<Duration>,
}

impl BoundInvoker {
    pub fn new(
        engine: Arc<MessagingEngine>,
        agent_id: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            agent_id: agent_id.into(),
            origin: origin.into(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl AgentInvoker for BoundInvoker {
    fn invoke<'a>(
        &'a self,
        agent_id: &'a str,
        request: InvocationRequest,
        cancel: &'a CancellationToken,
    ) -> InvokeFuture<'a> {
        Box::pin(async move {
            self.engine
                .invoke_with_cancel(
                    agent_id,
                    request,
                    &self.agent_id,
                    &self.origin,
                    self.timeout,
                    cancel,
                )
                .await
                .into_result()
        })
    }

    fn capabilities(&self, agent_id: &str) -> Option<BTreeSet<String>> {
        self.engine
            .registry()
            .get(agent_id)
            .map(|agent| agent.capabilities)
    }
}

const EVENT_BUFFER: usize = 16;

/// Entry point for the four patterns.
#[derive(Clone)]
pub struct Orchestrator {
    invoker: Arc<dyn AgentInvoker>,
}

impl Orchestrator {
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self { invoker }
    }

    pub async fn pipeline(
        &self,
        steps: &[PipelineStep],
        input: Value,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        pipeline::run(self.invoker.as_ref(), steps, input, cancel, None).await
    }

    /// Run a pipeline in the background and stream its progress.
    ///
    /// Dropping the stream stops the pipeline before its next step.
    pub fn stream_pipeline(
        &self,
        steps: Vec<PipelineStep>,
        input: Value,
        cancel: CancellationToken,
    ) -> ReceiverStream<PipelineEvent> {
        let (events, rx) = tokio::sync::mpsc::channel(EVENT_BUFFER);
        let invoker = Arc::clone(&self.invoker);
        tokio::spawn(async move {
            pipeline::run(invoker.as_ref(), &steps, input, &cancel, Some(&events)).await;
        });
        ReceiverStream::new(rx)
    }

    pub async fn parallel(
        &self,
        jobs: Vec<ParallelJob>,
        strategy: CombineStrategy,
        cancel: &CancellationToken,
    ) -> ParallelResult {
        parallel::run(&self.invoker, jobs, strategy, cancel).await
    }

    pub async fn route(
        &self,
        config: &RouterConfig,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<RouteResult> {
        router::run(self.invoker.as_ref(), config, input, cancel).await
    }

    pub async fn supervise(
        &self,
        config: &SupervisorConfig,
        tasks: Vec<SupervisorTask>,
        cancel: &CancellationToken,
    ) -> SupervisorResult {
        supervisor::run(&self.invoker, config, tasks, cancel).await
    }
}
