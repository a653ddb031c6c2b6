//! Worker pool with assignment strategies and per-task retry.
//!
//! Every task is assigned up front in submission order, so round-robin and
//! least-busy spread a batch deterministically. Retries pick again through
//! the same strategy, skipping workers that already failed the task when
//! `reassign_on_failure` is set and another worker is eligible.

use super::AgentInvoker;
use super::pipeline::elapsed_ms;
use crate::agents::{InvocationError, InvocationRequest};
use crate::error::KernelError;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastBusy,
    /// Only workers whose capabilities cover the task's requirements,
    /// round-robin among them.
    CapabilityMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub reassign_on_failure: bool,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: 0,
            reassign_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorTask {
    pub id: String,
    pub task: String,
    pub input: Value,
    pub required_capabilities: BTreeSet<String>,
}

impl SupervisorTask {
    pub fn new(id: impl Into<String>, task: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            input,
            required_capabilities: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn requiring<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupervisorConfig {
    pub workers: Vec<String>,
    pub strategy: AssignmentStrategy,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskAttempt {
    pub worker: String,
    pub success: bool,
    pub error: Option<InvocationError>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    /// Worker of the last attempt.
    pub worker: Option<String>,
    pub output: Option<Value>,
    pub error: Option<InvocationError>,
    pub attempts: Vec<TaskAttempt>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub total_tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorResult {
    pub success: bool,
    /// One entry per submitted task, in submission order.
    pub results: Vec<TaskResult>,
    pub stats: SupervisorStats,
    pub cancelled: bool,
}

#[derive(Default)]
struct PoolState {
    cursor: usize,
    in_flight: HashMap<String, usize>,
}

struct WorkerPool {
    workers: Vec<String>,
    strategy: AssignmentStrategy,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    fn new(config: &SupervisorConfig) -> Self {
        Self {
            workers: config.workers.clone(),
            strategy: config.strategy,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Pick a worker and count it as busy. `eligible` holds indexes into
    /// `workers` that satisfy the task's requirements.
    fn acquire(&self, eligible: &[usize], excluded: &BTreeSet<String>) -> Option<String> {
        let preferred: Vec<usize> = eligible
            .iter()
            .copied()
            .filter(|index| !excluded.contains(&self.workers[*index]))
            .collect();
        let candidates = if preferred.is_empty() {
            eligible
        } else {
            preferred.as_slice()
        };
        if candidates.is_empty() {
            return None;
        }

        let mut state = self.lock();
        let chosen = match self.strategy {
            AssignmentStrategy::RoundRobin | AssignmentStrategy::CapabilityMatch => {
                let count = self.workers.len();
                let chosen = (0..count)
                    .map(|offset| (state.cursor + offset) % count)
                    .find(|index| candidates.contains(index))?;
                state.cursor = (chosen + 1) % count;
                chosen
            }
            AssignmentStrategy::Random => candidates[rand::rng().random_range(0..candidates.len())],
            AssignmentStrategy::LeastBusy => *candidates.iter().min_by_key(|index| {
                state
                    .in_flight
                    .get(&self.workers[**index])
                    .copied()
                    .unwrap_or(0)
            })?,
        };
        let worker = self.workers[chosen].clone();
        *state.in_flight.entry(worker.clone()).or_default() += 1;
        Some(worker)
    }

    fn hold(&self, worker: &str) {
        *self.lock().in_flight.entry(worker.to_string()).or_default() += 1;
    }

    fn release(&self, worker: &str) {
        let mut state = self.lock();
        if let Some(count) = state.in_flight.get_mut(worker) {
            *count = count.saturating_sub(1);
        }
    }
}

struct Assignment {
    task: SupervisorTask,
    eligible: Vec<usize>,
    first_worker: Option<String>,
}

pub(super) async fn run(
    invoker: &Arc<dyn AgentInvoker>,
    config: &SupervisorConfig,
    tasks: Vec<SupervisorTask>,
    cancel: &CancellationToken,
) -> SupervisorResult {
    let started = Instant::now();
    let pool = Arc::new(WorkerPool::new(config));
    let task_cancel = cancel.child_token();
    let total = tasks.len();
    let task_ids: Vec<String> = tasks.iter().map(|task| task.id.clone()).collect();

    let mut pending = FuturesUnordered::new();
    for (index, task) in tasks.into_iter().enumerate() {
        let eligible = eligible_workers(invoker.as_ref(), config, &task);
        let first_worker = pool.acquire(&eligible, &BTreeSet::new());
        let assignment = Assignment {
            task,
            eligible,
            first_worker,
        };
        let handle = tokio::spawn(run_task(
            Arc::clone(invoker),
            Arc::clone(&pool),
            config.retry.clone(),
            assignment,
            task_cancel.clone(),
        ));
        let task_id = task_ids[index].clone();
        pending.push(async move {
            let result = handle.await.unwrap_or_else(|error| TaskResult {
                task_id,
                success: false,
                worker: None,
                output: None,
                error: Some(invocation_error(&KernelError::InvocationFailed(format!(
                    "task aborted: {error}"
                )))),
                attempts: Vec::new(),
            });
            (index, result)
        });
    }

    let mut results: Vec<Option<TaskResult>> = vec![None; total];
    let mut cancelled = false;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            next = pending.next() => {
                let Some((index, result)) = next else { break };
                results[index] = Some(result);
            }
        }
    }

    let results: Vec<TaskResult> = results
        .into_iter()
        .zip(task_ids)
        .map(|(result, task_id)| {
            result.unwrap_or_else(|| TaskResult {
                task_id,
                success: false,
                worker: None,
                output: None,
                error: Some(invocation_error(&KernelError::Cancelled)),
                attempts: Vec::new(),
            })
        })
        .collect();
    let succeeded = results.iter().filter(|result| result.success).count();
    let stats = SupervisorStats {
        total_tasks: total,
        succeeded,
        failed: total - succeeded,
        total_time_ms: elapsed_ms(started),
    };
    tracing::info!(
        total_tasks = stats.total_tasks,
        succeeded = stats.succeeded,
        failed = stats.failed,
        cancelled,
        "supervisor batch finished"
    );
    SupervisorResult {
        success: !cancelled && succeeded == total,
        results,
        stats,
        cancelled,
    }
}

fn eligible_workers(
    invoker: &dyn AgentInvoker,
    config: &SupervisorConfig,
    task: &SupervisorTask,
) -> Vec<usize> {
    let filter = config.strategy == AssignmentStrategy::CapabilityMatch
        && !task.required_capabilities.is_empty();
    (0..config.workers.len())
        .filter(|index| {
            !filter
                || invoker
                    .capabilities(&config.workers[*index])
                    .is_some_and(|declared| task.required_capabilities.is_subset(&declared))
        })
        .collect()
}

async fn run_task(
    invoker: Arc<dyn AgentInvoker>,
    pool: Arc<WorkerPool>,
    retry: RetryPolicy,
    assignment: Assignment,
    cancel: CancellationToken,
) -> TaskResult {
    let Assignment {
        task,
        eligible,
        first_worker,
    } = assignment;
    let mut result = TaskResult {
        task_id: task.id.clone(),
        success: false,
        worker: None,
        output: None,
        error: None,
        attempts: Vec::new(),
    };
    let Some(mut worker) = first_worker else {
        result.error = Some(invocation_error(&KernelError::Orchestration(format!(
            "no worker can take task {}",
            task.id
        ))));
        return result;
    };

    let max_attempts = retry.max_attempts.max(1);
    let mut failed_workers = BTreeSet::new();
    for attempt in 1..=max_attempts {
        if attempt > 1 {
            if retry.delay_ms > 0 {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(Duration::from_millis(retry.delay_ms)) => {}
                }
            }
            if cancel.is_cancelled() {
                result.error = Some(invocation_error(&KernelError::Cancelled));
                break;
            }
            if retry.reassign_on_failure {
                let Some(next) = pool.acquire(&eligible, &failed_workers) else {
                    break;
                };
                worker = next;
            } else {
                pool.hold(&worker);
            }
        }

        let attempt_started = Instant::now();
        let request = InvocationRequest::new(task.task.clone(), task.input.clone());
        let outcome = invoker.invoke(&worker, request, &cancel).await;
        pool.release(&worker);
        let duration_ms = elapsed_ms(attempt_started);
        result.worker = Some(worker.clone());

        match outcome {
            Ok(output) => {
                result.attempts.push(TaskAttempt {
                    worker: worker.clone(),
                    success: true,
                    error: None,
                    duration_ms,
                });
                result.success = true;
                result.output = Some(output);
                result.error = None;
                break;
            }
            Err(error) => {
                tracing::warn!(
                    task_id = %task.id,
                    %worker,
                    attempt,
                    %error,
                    "supervised task attempt failed"
                );
                let stop = matches!(
                    error,
                    KernelError::Cancelled | KernelError::PermissionDenied(_)
                );
                let error = invocation_error(&error);
                result.attempts.push(TaskAttempt {
                    worker: worker.clone(),
                    success: false,
                    error: Some(error.clone()),
                    duration_ms,
                });
                result.error = Some(error);
                failed_workers.insert(worker.clone());
                if stop {
                    break;
                }
            }
        }
    }

    let exhausted = result.attempts.len() >= max_attempts as usize;
    if !result.success && exhausted && max_attempts > 1 {
        let last = result
            .error
            .take()
            .map_or_else(String::new, |error| error.message);
        result.error = Some(invocation_error(&KernelError::BudgetExceeded(format!(
            "task {} failed {max_attempts} attempts, last: {last}",
            task.id
        ))));
    }
    result
}

fn invocation_error(error: &KernelError) -> InvocationError {
    InvocationError {
        code: error.code(),
        message: error.to_string(),
    }
}
