//! Priority Scheduling Under a Concurrency Cap
//!
//! Admitted work waits in one FIFO queue per [`Priority`] and is dispatched
//! under a global cap on running tasks.
//!
//! # Dispatch
//!
//! Whenever a slot frees (or new work arrives with a slot free) the next task
//! is taken strictly from `high`, then `normal`, then `low`, oldest first
//! within a tier. There is no aging.
//!
//! # Timeouts and Cancellation
//!
//! Both are cooperative. A task that exceeds its timeout is reported as
//! [`SchedulerError::TaskTimeout`] and gives up its slot, but its executor is
//! not aborted: it keeps running detached, its [`CancelSignal`] is raised,
//! and whatever it eventually returns is discarded. Cancelling a pending task
//! removes it from its queue; cancelling a running task only raises the
//! signal.
//!
//! # Example
//!
//! ```no_run
//! use admission_core::scheduler::{Scheduler, TaskRequest};
//! use admission_core::{ExecutionError, Priority};
//!
//! # async fn demo() -> Result<(), admission_core::SchedulerError> {
//! let scheduler = Scheduler::with_defaults();
//! let handle = scheduler.schedule(
//!     TaskRequest::new("llama3.2").with_priority(Priority::High),
//!     |ctx| async move { Ok::<_, ExecutionError>(format!("ran {}", ctx.task_id)) },
//! );
//! let output = handle.join().await?;
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinError;

use crate::clock::{duration_millis, SharedClock, SystemClock};
use crate::error::{ExecutionError, SchedulerError};
use crate::events::{AdmissionEvent, EventBus};
use crate::metrics::Histogram;
use crate::tasks::{Priority, TaskId, TaskInfo, TaskStatus};

type Output = Box<dyn Any + Send>;
type TaskOutcome = Result<Output, SchedulerError>;
type Job = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, Result<Output, ExecutionError>> + Send>;

// ============================================================================
// Configuration
// ============================================================================

/// Scheduler configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tasks allowed to run at once, across all priorities and resources
    pub max_concurrent_tasks: usize,

    /// Settled tasks kept for status queries
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            history_limit: 1000,
        }
    }
}

impl SchedulerConfig {
    /// Set the concurrency cap
    #[must_use]
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Set the history bound
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

// ============================================================================
// Task Plumbing
// ============================================================================

/// Cooperative cancellation signal handed to executors
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Task settled without a cancel request
            std::future::pending::<()>().await;
        }
    }
}

/// What an executor learns about the task it runs
#[derive(Clone, Debug)]
pub struct TaskContext {
    /// Task id
    pub task_id: TaskId,
    /// Resource the task targets
    pub resource_id: String,
    /// Priority it was dispatched at
    pub priority: Priority,
    /// Raised on timeout, cancel or disposal
    pub cancel: CancelSignal,
}

/// Parameters for [`Scheduler::schedule`]
#[derive(Clone, Debug)]
pub struct TaskRequest {
    /// Resource the work targets
    pub resource_id: String,
    /// Dispatch priority
    pub priority: Priority,
    /// Soft execution timeout
    pub timeout: Option<Duration>,
}

impl TaskRequest {
    /// Normal-priority request with no timeout
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            priority: Priority::Normal,
            timeout: None,
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the soft timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Handle to a scheduled task's result
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: TaskId,
    rx: oneshot::Receiver<TaskOutcome>,
    _output: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> TaskHandle<T> {
    fn new(id: TaskId, rx: oneshot::Receiver<TaskOutcome>) -> Self {
        Self {
            id,
            rx,
            _output: PhantomData,
        }
    }

    /// The task id, available before the task runs
    #[must_use]
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Wait for the task to settle
    ///
    /// # Errors
    ///
    /// Returns the executor's failure, a timeout, cancellation, or
    /// [`SchedulerError::Disposed`].
    pub async fn join(self) -> Result<T, SchedulerError> {
        match self.rx.await {
            Ok(Ok(output)) => output.downcast::<T>().map(|value| *value).map_err(|_| {
                SchedulerError::Execution(ExecutionError::new(
                    "task produced an unexpected result type",
                ))
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SchedulerError::Disposed),
        }
    }
}

/// Result of [`Scheduler::cancel`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was pending and has been removed
    Cancelled,
    /// The task is running; its cancel signal was raised
    Signalled,
    /// No pending or running task has that id
    NotFound,
}

/// Scheduler statistics
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SchedulerMetrics {
    /// Tasks ever scheduled
    pub total_tasks: u64,
    /// Tasks whose executor resolved
    pub completed_tasks: u64,
    /// Tasks that failed or timed out
    pub failed_tasks: u64,
    /// Tasks cancelled while pending
    pub cancelled_tasks: u64,
    /// Tasks waiting in queues
    pub pending_tasks: usize,
    /// Tasks holding a slot
    pub active_tasks: usize,
    /// Most tasks ever running at once
    pub peak_concurrency: usize,
    /// Mean time from schedule to start
    pub average_wait_time: Duration,
    /// Mean time from start to settle
    pub average_processing_time: Duration,
    /// Median queue wait bucket (ms)
    pub p50_wait_ms: f64,
    /// 99th percentile queue wait bucket (ms)
    pub p99_wait_ms: f64,
    /// Median processing bucket (ms)
    pub p50_processing_ms: f64,
    /// 99th percentile processing bucket (ms)
    pub p99_processing_ms: f64,
    /// Completed tasks per second since creation
    pub throughput_per_sec: f64,
}

// ============================================================================
// Internal State
// ============================================================================

struct PendingTask {
    info: TaskInfo,
    job: Job,
    responder: oneshot::Sender<TaskOutcome>,
    cancel_tx: watch::Sender<bool>,
}

struct ActiveTask {
    info: TaskInfo,
    responder: oneshot::Sender<TaskOutcome>,
    cancel_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct SchedulerState {
    config: SchedulerConfig,
    queues: [VecDeque<PendingTask>; 3],
    active: HashMap<TaskId, ActiveTask>,
    history: VecDeque<TaskInfo>,
    total_tasks: u64,
    completed_tasks: u64,
    failed_tasks: u64,
    cancelled_tasks: u64,
    peak_concurrency: usize,
    disposed: bool,
}

impl SchedulerState {
    fn pop_next(&mut self) -> Option<PendingTask> {
        self.queues.iter_mut().find_map(VecDeque::pop_front)
    }

    fn pending_count(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn find_pending(&self, task_id: &TaskId) -> Option<(usize, usize)> {
        self.queues.iter().enumerate().find_map(|(tier, queue)| {
            queue
                .iter()
                .position(|task| &task.info.id == task_id)
                .map(|pos| (tier, pos))
        })
    }

    fn push_history(&mut self, info: TaskInfo) {
        if self.config.history_limit == 0 {
            return;
        }
        while self.history.len() >= self.config.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(info);
    }
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    wait_times: Histogram,
    processing_times: Histogram,
    clock: SharedClock,
    events: EventBus,
    created_at: Instant,
}

impl SchedulerInner {
    /// Fill free slots from the queues
    fn pump(self: &Arc<Self>) {
        loop {
            let (info, job, cancel) = {
                let mut state = self.state.lock();
                if state.disposed || state.active.len() >= state.config.max_concurrent_tasks {
                    return;
                }
                let Some(pending) = state.pop_next() else {
                    return;
                };

                let PendingTask {
                    mut info,
                    job,
                    responder,
                    cancel_tx,
                } = pending;
                let now = self.clock.now();
                info.status = TaskStatus::Running;
                info.started_at = Some(now);
                let waited = now.saturating_duration_since(info.enqueued_at);
                self.wait_times.record(waited);

                let cancel = CancelSignal {
                    rx: cancel_tx.subscribe(),
                };
                state.active.insert(
                    info.id.clone(),
                    ActiveTask {
                        info: info.clone(),
                        responder,
                        cancel_tx,
                    },
                );
                state.peak_concurrency = state.peak_concurrency.max(state.active.len());

                tracing::trace!(
                    task_id = %info.id,
                    resource = %info.resource_id,
                    priority = %info.priority,
                    waited_ms = duration_millis(waited),
                    "Task dispatched"
                );
                self.events.emit(AdmissionEvent::TaskStarted {
                    task_id: info.id.clone(),
                    resource_id: info.resource_id.clone(),
                    waited,
                });

                (info, job, cancel)
            };

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.run(info, job, cancel).await;
            });
        }
    }

    async fn run(self: Arc<Self>, info: TaskInfo, job: Job, cancel: CancelSignal) {
        let ctx = TaskContext {
            task_id: info.id.clone(),
            resource_id: info.resource_id.clone(),
            priority: info.priority,
            cancel,
        };

        // Spawned separately so a timeout detaches the executor instead of dropping it
        let execution = tokio::spawn(job(ctx));
        let outcome = match info.timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(joined) => flatten(joined),
                Err(_) => Err(SchedulerError::TaskTimeout {
                    task_id: info.id.clone(),
                    timeout: limit,
                }),
            },
            None => flatten(execution.await),
        };

        self.finish(&info.id, outcome);
        self.pump();
    }

    fn finish(&self, task_id: &TaskId, outcome: TaskOutcome) {
        let now = self.clock.now();
        let responder = {
            let mut state = self.state.lock();
            let Some(active) = state.active.remove(task_id) else {
                // Disposed while running; the handle was already rejected
                return;
            };
            let ActiveTask {
                mut info,
                responder,
                cancel_tx,
            } = active;

            info.finished_at = Some(now);
            let elapsed = info.processing_time().unwrap_or_default();
            self.processing_times.record(elapsed);

            match &outcome {
                Ok(_) => {
                    info.status = TaskStatus::Completed;
                    state.completed_tasks += 1;
                    self.events.emit(AdmissionEvent::TaskCompleted {
                        task_id: info.id.clone(),
                        resource_id: info.resource_id.clone(),
                        elapsed,
                    });
                }
                Err(err) => {
                    if matches!(err, SchedulerError::TaskTimeout { .. }) {
                        cancel_tx.send_replace(true);
                    }
                    info.status = TaskStatus::Failed;
                    info.error = Some(err.to_string());
                    state.failed_tasks += 1;
                    tracing::debug!(
                        task_id = %info.id,
                        resource = %info.resource_id,
                        error = %err,
                        "Task failed"
                    );
                    self.events.emit(AdmissionEvent::TaskFailed {
                        task_id: info.id.clone(),
                        resource_id: info.resource_id.clone(),
                        error: err.to_string(),
                    });
                }
            }

            state.push_history(info);
            responder
        };

        if responder.send(outcome).is_err() {
            tracing::trace!(task_id = %task_id, "Task handle dropped before result");
        }
    }
}

fn flatten(joined: Result<Result<Output, ExecutionError>, JoinError>) -> TaskOutcome {
    match joined {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(SchedulerError::Execution(err)),
        Err(join_err) if join_err.is_panic() => Err(SchedulerError::Execution(
            ExecutionError::new("executor panicked"),
        )),
        Err(_) => Err(SchedulerError::Execution(ExecutionError::new(
            "executor aborted",
        ))),
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Priority queues plus a global concurrency cap
///
/// Cloning shares the underlying state. Scheduling must happen inside a
/// Tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler
    ///
    /// A `max_concurrent_tasks` of 0 is raised to 1.
    #[must_use]
    pub fn new(mut config: SchedulerConfig, clock: SharedClock, events: EventBus) -> Self {
        config.max_concurrent_tasks = config.max_concurrent_tasks.max(1);
        let created_at = clock.now();
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState {
                    config,
                    ..SchedulerState::default()
                }),
                wait_times: Histogram::latency_default(),
                processing_times: Histogram::latency_default(),
                clock,
                events,
                created_at,
            }),
        }
    }

    /// Create a scheduler with default configuration and the system clock
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(
            SchedulerConfig::default(),
            SystemClock::shared(),
            EventBus::new(),
        )
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        self.inner.state.lock().config.clone()
    }

    /// Change the concurrency cap; applies to future dispatch
    pub fn set_max_concurrent_tasks(&self, max: usize) {
        self.inner.state.lock().config.max_concurrent_tasks = max.max(1);
        self.inner.pump();
    }

    /// Queue work and dispatch it when a slot is free
    ///
    /// The executor receives a [`TaskContext`] and owns whatever payload it
    /// captured. After [`dispose`](Self::dispose) the returned handle
    /// resolves to [`SchedulerError::Disposed`].
    pub fn schedule<T, F, Fut>(&self, request: TaskRequest, executor: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ExecutionError>> + Send + 'static,
    {
        let (responder, rx) = oneshot::channel();
        let info = TaskInfo::pending(
            request.resource_id,
            request.priority,
            request.timeout,
            self.inner.clock.now(),
        );
        let id = info.id.clone();

        let job: Job = Box::new(move |ctx| {
            async move {
                executor(ctx)
                    .await
                    .map(|value| Box::new(value) as Output)
            }
            .boxed()
        });

        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                let _ = responder.send(Err(SchedulerError::Disposed));
                return TaskHandle::new(id, rx);
            }

            tracing::debug!(
                task_id = %info.id,
                resource = %info.resource_id,
                priority = %info.priority,
                "Task scheduled"
            );
            self.inner.events.emit(AdmissionEvent::TaskScheduled {
                task_id: info.id.clone(),
                resource_id: info.resource_id.clone(),
                priority: info.priority,
            });

            state.total_tasks += 1;
            let (cancel_tx, _) = watch::channel(false);
            state.queues[info.priority.index()].push_back(PendingTask {
                info,
                job,
                responder,
                cancel_tx,
            });
        }

        self.inner.pump();
        TaskHandle::new(id, rx)
    }

    /// Cancel a task
    ///
    /// Pending tasks are removed and their handle resolves to
    /// [`SchedulerError::Cancelled`]. Running tasks only get their cancel
    /// signal raised.
    pub fn cancel(&self, task_id: &TaskId) -> CancelOutcome {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();

        if let Some((tier, pos)) = state.find_pending(task_id) {
            let Some(pending) = state.queues[tier].remove(pos) else {
                return CancelOutcome::NotFound;
            };
            let PendingTask {
                mut info,
                responder,
                cancel_tx,
                ..
            } = pending;
            cancel_tx.send_replace(true);
            info.status = TaskStatus::Cancelled;
            info.finished_at = Some(now);
            state.cancelled_tasks += 1;
            state.push_history(info);
            drop(state);

            let _ = responder.send(Err(SchedulerError::Cancelled {
                task_id: task_id.clone(),
            }));
            tracing::debug!(task_id = %task_id, "Pending task cancelled");
            return CancelOutcome::Cancelled;
        }

        if let Some(active) = state.active.get(task_id) {
            active.cancel_tx.send_replace(true);
            tracing::debug!(task_id = %task_id, "Cancel requested for running task");
            return CancelOutcome::Signalled;
        }

        CancelOutcome::NotFound
    }

    /// Snapshot of a pending, running or recently settled task
    #[must_use]
    pub fn get_status(&self, task_id: &TaskId) -> Option<TaskInfo> {
        let state = self.inner.state.lock();
        if let Some((tier, pos)) = state.find_pending(task_id) {
            return state.queues[tier].get(pos).map(|task| task.info.clone());
        }
        if let Some(active) = state.active.get(task_id) {
            return Some(active.info.clone());
        }
        state
            .history
            .iter()
            .rev()
            .find(|info| &info.id == task_id)
            .cloned()
    }

    /// Aggregate statistics
    #[must_use]
    pub fn get_metrics(&self) -> SchedulerMetrics {
        let wait = self.inner.wait_times.snapshot();
        let processing = self.inner.processing_times.snapshot();
        let uptime = self
            .inner
            .clock
            .now()
            .saturating_duration_since(self.inner.created_at)
            .as_secs_f64();

        let state = self.inner.state.lock();
        let throughput_per_sec = if uptime > 0.0 {
            state.completed_tasks as f64 / uptime
        } else {
            0.0
        };

        SchedulerMetrics {
            total_tasks: state.total_tasks,
            completed_tasks: state.completed_tasks,
            failed_tasks: state.failed_tasks,
            cancelled_tasks: state.cancelled_tasks,
            pending_tasks: state.pending_count(),
            active_tasks: state.active.len(),
            peak_concurrency: state.peak_concurrency,
            average_wait_time: self.inner.wait_times.mean(),
            average_processing_time: self.inner.processing_times.mean(),
            p50_wait_ms: wait.p50(),
            p99_wait_ms: wait.p99(),
            p50_processing_ms: processing.p50(),
            p99_processing_ms: processing.p99(),
            throughput_per_sec,
        }
    }

    /// Tasks waiting in queues
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending_count()
    }

    /// Tasks holding a slot
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// Whether [`dispose`](Self::dispose) has been called
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Reject all queued and running tasks and clear state; idempotent
    ///
    /// Running executors get their cancel signal and are left to finish on
    /// their own.
    pub fn dispose(&self) {
        let (pending, active, first) = {
            let mut state = self.inner.state.lock();
            let first = !state.disposed;
            state.disposed = true;
            let pending: Vec<PendingTask> = state
                .queues
                .iter_mut()
                .flat_map(std::mem::take)
                .collect();
            let active: Vec<ActiveTask> = state.active.drain().map(|(_, task)| task).collect();
            state.history.clear();
            (pending, active, first)
        };

        let rejected = pending.len() + active.len();
        for task in pending {
            let _ = task.responder.send(Err(SchedulerError::Disposed));
        }
        for task in active {
            task.cancel_tx.send_replace(true);
            let _ = task.responder.send(Err(SchedulerError::Disposed));
        }

        if first {
            tracing::info!(rejected, "Scheduler disposed");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Scheduler")
            .field("config", &state.config)
            .field("pending", &state.pending_count())
            .field("active", &state.active.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
