use super::AgentInvoker;
use super::template::{as_text, render_task};
use crate::agents::{InvocationError, InvocationRequest};
use crate::error::{KernelError, Result};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Reshape a step's output before it feeds the next step.
#[derive(Clone)]
pub enum OutputTransform {
    /// Object field, or a JSON pointer when it starts with `/`.
    Pick(String),
    /// Collapse to a string.
    Text,
    Custom(Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>),
}

impl fmt::Debug for OutputTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pick(path) => f.debug_tuple("Pick").field(path).finish(),
            Self::Text => f.write_str("Text"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl OutputTransform {
    fn apply(&self, output: Value) -> Result<Value> {
        match self {
            Self::Pick(path) => {
                let picked = if path.starts_with('/') {
                    output.pointer(path)
                } else {
                    output.get(path)
                };
                picked.cloned().ok_or_else(|| {
                    KernelError::Orchestration(format!("step output has no `{path}`"))
                })
            }
            Self::Text => Ok(Value::String(as_text(&output))),
            Self::Custom(transform) => transform(output),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineStep {
    pub agent_id: String,
    pub task_template: String,
    pub transform: Option<OutputTransform>,
}

impl PipelineStep {
    pub fn new(agent_id: impl Into<String>, task_template: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_template: task_template.into(),
            transform: None,
        }
    }

    #[must_use]
    pub fn with_transform(mut self, transform: OutputTransform) -> Self {
        self.transform = Some(transform);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub index: usize,
    pub agent_id: String,
    pub task: String,
    pub output: Value,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    /// Final output. Present only when every step succeeded.
    pub output: Option<Value>,
    /// Every step that completed, in order.
    pub steps: Vec<StepResult>,
    pub failed_step: Option<usize>,
    pub error: Option<InvocationError>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StepStarted { index: usize, agent_id: String },
    StepCompleted { index: usize, output: Value },
    StepFailed { index: usize, error: InvocationError },
    Finished { output: Value },
    Cancelled { completed: usize },
}

pub(super) async fn run(
    invoker: &dyn AgentInvoker,
    steps: &[PipelineStep],
    input: Value,
    cancel: &CancellationToken,
    events: Option<&mpsc::Sender<PipelineEvent>>,
) -> PipelineResult {
    let started = Instant::now();
    let emit = |event: PipelineEvent| async move {
        match events {
            Some(events) => events.send(event).await.is_ok(),
            None => true,
        }
    };

    let mut result = PipelineResult {
        success: false,
        output: None,
        steps: Vec::with_capacity(steps.len()),
        failed_step: None,
        error: None,
        cancelled: false,
        duration_ms: 0,
    };
    let mut current = input.clone();

    for (index, step) in steps.iter().enumerate() {
        if cancel.is_cancelled() {
            result.cancelled = true;
            break;
        }
        if !emit(PipelineEvent::StepStarted {
            index,
            agent_id: step.agent_id.clone(),
        })
        .await
        {
            // Consumer went away.
            result.cancelled = true;
            break;
        }

        let step_started = Instant::now();
        match run_step(invoker, step, &current, &input, cancel).await {
            Ok((task, output)) => {
                emit(PipelineEvent::StepCompleted {
                    index,
                    output: output.clone(),
                })
                .await;
                result.steps.push(StepResult {
                    index,
                    agent_id: step.agent_id.clone(),
                    task,
                    output: output.clone(),
                    duration_ms: elapsed_ms(step_started),
                });
                current = output;
            }
            Err(KernelError::Cancelled) => {
                result.cancelled = true;
                break;
            }
            Err(error) => {
                tracing::warn!(index, agent_id = %step.agent_id, %error, "pipeline step failed");
                let error = InvocationError {
                    code: error.code(),
                    message: error.to_string(),
                };
                emit(PipelineEvent::StepFailed {
                    index,
                    error: error.clone(),
                })
                .await;
                result.failed_step = Some(index);
                result.error = Some(error);
                break;
            }
        }
    }

    if result.cancelled {
        emit(PipelineEvent::Cancelled {
            completed: result.steps.len(),
        })
        .await;
    } else if result.error.is_none() {
        result.success = true;
        emit(PipelineEvent::Finished {
            output: current.clone(),
        })
        .await;
        result.output = Some(current);
    }
    result.duration_ms = elapsed_ms(started);
    result
}

async fn run_step(
    invoker: &dyn AgentInvoker,
    step: &PipelineStep,
    current: &Value,
    original: &Value,
    cancel: &CancellationToken,
) -> Result<(String, Value)> {
    let task = render_task(&step.task_template, current, original)?;
    let request = InvocationRequest::new(task.clone(), current.clone());
    let output = invoker.invoke(&step.agent_id, request, cancel).await?;
    let output = match &step.transform {
        Some(transform) => transform.apply(output)?,
        None => output,
    };
    Ok((task, output))
}

pub(super) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
