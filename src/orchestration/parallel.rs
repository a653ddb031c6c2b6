use super::AgentInvoker;
use super::pipeline::elapsed_ms;
use crate::agents::{InvocationError, InvocationRequest};
use crate::error::{KernelError, Result};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelJob {
    pub agent_id: String,
    pub task: String,
    pub input: Value,
}

impl ParallelJob {
    pub fn new(agent_id: impl Into<String>, task: impl Into<String>, input: Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            task: task.into(),
            input,
        }
    }
}

pub type CombineFn = Arc<dyn Fn(&[JobResult]) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
pub enum CombineStrategy {
    /// Outputs in job order.
    Array,
    /// Shallow merge of object outputs, later jobs win.
    Merge,
    /// First job to succeed. The rest keep running detached.
    First,
    Custom(CombineFn),
}

impl fmt::Debug for CombineStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Array => "Array",
            Self::Merge => "Merge",
            Self::First => "First",
            Self::Custom(_) => "Custom(..)",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub index: usize,
    pub agent_id: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<InvocationError>,
    pub duration_ms: u64,
}

impl JobResult {
    fn settled(index: usize, agent_id: String, outcome: Result<Value>, duration_ms: u64) -> Self {
        let (output, error) = match outcome {
            Ok(output) => (Some(output), None),
            Err(error) => (
                None,
                Some(InvocationError {
                    code: error.code(),
                    message: error.to_string(),
                }),
            ),
        };
        Self {
            index,
            agent_id,
            success: error.is_none(),
            output,
            error,
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelResult {
    pub success: bool,
    pub output: Option<Value>,
    /// Settled jobs sorted by index. Jobs still running when the run
    /// returned are absent.
    pub jobs: Vec<JobResult>,
    pub error: Option<InvocationError>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

pub(super) async fn run(
    invoker: &Arc<dyn AgentInvoker>,
    jobs: Vec<ParallelJob>,
    strategy: CombineStrategy,
    cancel: &CancellationToken,
) -> ParallelResult {
    let started = Instant::now();
    let job_cancel = cancel.child_token();
    let total = jobs.len();

    let mut pending = jobs
        .into_iter()
        .enumerate()
        .map(|(index, job)| {
            let invoker = Arc::clone(invoker);
            let token = job_cancel.clone();
            let agent_id = job.agent_id.clone();
            let handle = tokio::spawn(async move {
                let job_started = Instant::now();
                let request = InvocationRequest::new(job.task, job.input);
                let outcome = invoker.invoke(&job.agent_id, request, &token).await;
                JobResult::settled(index, job.agent_id, outcome, elapsed_ms(job_started))
            });
            async move {
                match handle.await {
                    Ok(result) => result,
                    Err(error) => JobResult::settled(
                        index,
                        agent_id,
                        Err(KernelError::InvocationFailed(format!("job aborted: {error}"))),
                        0,
                    ),
                }
            }
        })
        .collect::<FuturesUnordered<_>>();

    let first_only = matches!(strategy, CombineStrategy::First);
    let mut settled = Vec::with_capacity(total);
    let mut cancelled = false;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            next = pending.next() => {
                let Some(result) = next else { break };
                let won = first_only && result.success;
                settled.push(result);
                if won {
                    break;
                }
            }
        }
    }
    settled.sort_by_key(|job| job.index);
    tracing::debug!(
        total,
        settled = settled.len(),
        cancelled,
        "parallel run settled"
    );

    let combined = if cancelled {
        Err(KernelError::Cancelled)
    } else {
        combine(&strategy, &settled)
    };
    let (success, output, error) = match combined {
        Ok(output) => (true, Some(output), None),
        Err(error) => (
            false,
            None,
            Some(InvocationError {
                code: error.code(),
                message: error.to_string(),
            }),
        ),
    };
    ParallelResult {
        success,
        output,
        jobs: settled,
        error,
        cancelled,
        duration_ms: elapsed_ms(started),
    }
}

fn combine(strategy: &CombineStrategy, jobs: &[JobResult]) -> Result<Value> {
    if let CombineStrategy::Custom(combine) = strategy {
        return combine(jobs);
    }
    if let CombineStrategy::First = strategy {
        return match jobs.iter().find(|job| job.success) {
            Some(job) => Ok(job.output.clone().unwrap_or(Value::Null)),
            None => Err(first_failure(jobs).unwrap_or_else(|| {
                KernelError::Orchestration("no job succeeded".to_string())
            })),
        };
    }
    if let Some(error) = first_failure(jobs) {
        return Err(error);
    }

    let outputs = jobs
        .iter()
        .map(|job| job.output.clone().unwrap_or(Value::Null));
    match strategy {
        CombineStrategy::Merge => {
            let mut merged = Map::new();
            for (index, output) in outputs.enumerate() {
                let Value::Object(fields) = output else {
                    return Err(KernelError::Orchestration(format!(
                        "job {index} returned a non-object and cannot be merged"
                    )));
                };
                merged.extend(fields);
            }
            Ok(Value::Object(merged))
        }
        _ => Ok(Value::Array(outputs.collect())),
    }
}

fn first_failure(jobs: &[JobResult]) -> Option<KernelError> {
    let job = jobs.iter().find(|job| !job.success)?;
    let message = job
        .error
        .as_ref()
        .map_or_else(|| "job failed".to_string(), |error| error.message.clone());
    Some(KernelError::Orchestration(format!(
        "job {} ({}) failed: {message}",
        job.index, job.agent_id
    )))
}
