//! Admission Pipeline
//!
//! Composes the three components into the request path:
//!
//! ```text
//! submit(request, executor)
//!         |
//!         v
//! FailurePolicy::check ------- open circuit ----> AdmissionError::CircuitOpen
//!         |
//!         v
//! RateLimiter::acquire ------- refused ----------> AdmissionError::RateLimited
//!         |
//!         v
//! FailurePolicy::record_request
//!         |
//!         v
//! Scheduler::schedule + join
//!         |
//!    ok   |   err
//!   +-----+-----+
//!   v           v
//! record_    handle_failure + execute_strategy
//! success        |
//!                v
//!          AdmissionError::Failed { strategy }
//! ```
//!
//! [`AdmissionPipeline::submit_with_recovery`] acts on the returned
//! strategies itself: it retries after the strategy's backoff and walks the
//! resource's fallback chain, bounded by
//! [`PipelineSettings::max_total_attempts`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::clock::{duration_millis, SharedClock, SystemClock};
use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, ExecutionError, RateLimitError, SchedulerError};
use crate::events::{AdmissionEvent, EventBus};
use crate::failure::{FailurePolicy, PolicySnapshot};
use crate::rate_limit::{RateLimitConfig, RateLimitStatus, RateLimiter};
use crate::scheduler::{Scheduler, SchedulerMetrics, TaskContext, TaskRequest};
use crate::tasks::Priority;

// ============================================================================
// Settings and Requests
// ============================================================================

/// Pipeline-level settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Upper bound on attempts made by `submit_with_recovery`, across
    /// retries and fallbacks
    pub max_total_attempts: u32,

    /// Spawn the limiter's background drain and stale sweep on construction
    pub start_maintenance: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_total_attempts: 6,
            start_maintenance: true,
        }
    }
}

/// One unit of work offered to the pipeline
#[derive(Clone, Debug)]
pub struct AdmissionRequest {
    /// Resource the work targets
    pub resource_id: String,
    /// Scheduling priority
    pub priority: Priority,
    /// Soft execution timeout
    pub timeout: Option<Duration>,
    /// Rate limiter wait bound (limiter default when `None`)
    pub acquire_timeout: Option<Duration>,
}

impl AdmissionRequest {
    /// Normal-priority request with default timeouts
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            priority: Priority::Normal,
            timeout: None,
            acquire_timeout: None,
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the execution timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the rate limiter wait bound
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    fn task_request(&self) -> TaskRequest {
        let request = TaskRequest::new(self.resource_id.clone()).with_priority(self.priority);
        match self.timeout {
            Some(timeout) => request.with_timeout(timeout),
            None => request,
        }
    }
}

/// Reusable executor for [`AdmissionPipeline::submit_with_recovery`]
///
/// Called once per attempt; the context names the resource the attempt runs
/// against, which changes when the pipeline falls back.
#[async_trait]
pub trait TaskExecutor<T>: Send + Sync {
    /// Run one attempt
    async fn execute(&self, ctx: TaskContext) -> Result<T, ExecutionError>;
}

#[async_trait]
impl<T, F, Fut> TaskExecutor<T> for F
where
    T: Send + 'static,
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, ExecutionError>> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> Result<T, ExecutionError> {
        (self)(ctx).await
    }
}

/// Per-resource view combining limiter and policy state
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceStats {
    /// Resource key
    pub resource_id: String,
    /// Rate limiter status
    pub limiter: Option<RateLimitStatus>,
    /// Failure policy state (absent until the resource saw traffic)
    pub policy: Option<PolicySnapshot>,
}

/// Pipeline-wide statistics
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineStats {
    /// Scheduler metrics
    pub scheduler: SchedulerMetrics,
    /// One entry per configured resource
    pub resources: Vec<ResourceStats>,
}

enum NextStep {
    Retry(Duration),
    Fallback,
    GiveUp,
}

// ============================================================================
// Pipeline
// ============================================================================

/// Rate limiting, scheduling and failure handling behind one entry point
///
/// Cloning shares the underlying components.
#[derive(Clone)]
pub struct AdmissionPipeline {
    limiter: RateLimiter,
    scheduler: Scheduler,
    policy: FailurePolicy,
    events: EventBus,
    settings: PipelineSettings,
    fallbacks: Arc<RwLock<HashMap<String, Vec<String>>>>,
    disposed: Arc<AtomicBool>,
}

impl AdmissionPipeline {
    /// Build a pipeline from resolved configuration
    ///
    /// Maintenance tasks are only started when called inside a Tokio
    /// runtime.
    #[must_use]
    pub fn new(config: &AdmissionConfig, clock: SharedClock) -> Self {
        let events = EventBus::new();
        let limiter = RateLimiter::new(config.limiter.clone(), Arc::clone(&clock), events.clone());
        let scheduler = Scheduler::new(config.scheduler.clone(), Arc::clone(&clock), events.clone());
        let policy = FailurePolicy::new(config.failure_policy.clone(), clock, events.clone());

        let pipeline = Self {
            limiter,
            scheduler,
            policy,
            events,
            settings: config.pipeline.clone(),
            fallbacks: Arc::new(RwLock::new(HashMap::new())),
            disposed: Arc::new(AtomicBool::new(false)),
        };

        for (resource_id, limit) in &config.resources {
            pipeline.configure_resource(resource_id.clone(), limit.clone());
        }
        for (resource_id, chain) in &config.fallbacks {
            pipeline.set_fallbacks(resource_id.clone(), chain.clone());
        }

        if config.pipeline.start_maintenance {
            if tokio::runtime::Handle::try_current().is_ok() {
                pipeline.limiter.start_maintenance();
            } else {
                tracing::debug!("No runtime; limiter maintenance not started");
            }
        }

        tracing::info!(
            resources = config.resources.len(),
            max_concurrent = config.scheduler.max_concurrent_tasks,
            "Admission pipeline ready"
        );
        pipeline
    }

    /// Build a pipeline on the system clock
    #[must_use]
    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(config, SystemClock::shared())
    }

    /// Pipeline with default configuration and no resources
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::from_config(&AdmissionConfig::default())
    }

    /// Install or replace a resource's rate limit
    pub fn configure_resource(&self, resource_id: impl Into<String>, config: RateLimitConfig) {
        self.limiter.configure(resource_id, config);
    }

    /// Set the ordered fallback chain for a resource
    ///
    /// The resource itself and repeated entries are dropped.
    pub fn set_fallbacks(&self, resource_id: impl Into<String>, chain: Vec<String>) {
        let resource_id = resource_id.into();
        let mut seen = HashSet::new();
        seen.insert(resource_id.clone());
        let chain: Vec<String> = chain
            .into_iter()
            .filter(|candidate| seen.insert(candidate.clone()))
            .collect();

        tracing::debug!(resource = %resource_id, chain = ?chain, "Fallback chain set");
        let mut fallbacks = self.fallbacks.write();
        if chain.is_empty() {
            fallbacks.remove(&resource_id);
        } else {
            fallbacks.insert(resource_id, chain);
        }
    }

    /// Fallback chain for a resource
    #[must_use]
    pub fn fallbacks(&self, resource_id: &str) -> Vec<String> {
        self.fallbacks
            .read()
            .get(resource_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Run one attempt through the full admission path
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::CircuitOpen`] while the resource's circuit is open
    /// - [`AdmissionError::RateLimited`] when the limiter refuses
    /// - [`AdmissionError::Failed`] when the executor fails or times out,
    ///   carrying the recovery strategy the policy chose
    /// - [`AdmissionError::Disposed`] after [`dispose`](Self::dispose)
    pub async fn submit<T, F, Fut>(
        &self,
        request: AdmissionRequest,
        executor: F,
    ) -> Result<T, AdmissionError>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ExecutionError>> + Send + 'static,
    {
        let request_id = Uuid::new_v4().to_string();
        self.attempt(&request, &request_id, executor).await
    }

    /// Submit and act on recovery strategies until success or exhaustion
    ///
    /// Retries against the same resource while the strategy allows it,
    /// sleeping for its backoff. Fallback, circuit break, open circuits and
    /// limiter refusals move on to the next fallback resource whose circuit
    /// admits traffic. Stops after `max_total_attempts` attempts.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error once no step remains.
    pub async fn submit_with_recovery<T, E>(
        &self,
        request: AdmissionRequest,
        executor: E,
    ) -> Result<T, AdmissionError>
    where
        T: Send + 'static,
        E: TaskExecutor<T> + 'static,
    {
        let executor = Arc::new(executor);
        let request_id = Uuid::new_v4().to_string();
        let primary = request.resource_id.clone();
        let mut current = request;
        let mut tried: HashSet<String> = HashSet::from([primary.clone()]);
        let mut retries_here = 0u32;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let exec = Arc::clone(&executor);
            let result = self
                .attempt(&current, &request_id, move |ctx| async move {
                    exec.execute(ctx).await
                })
                .await;

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempts >= self.settings.max_total_attempts {
                tracing::debug!(
                    request_id = %request_id,
                    attempts,
                    "Attempt budget exhausted"
                );
                return Err(err);
            }

            match next_step(&err, retries_here) {
                NextStep::Retry(backoff) => {
                    retries_here += 1;
                    tracing::debug!(
                        request_id = %request_id,
                        resource = %current.resource_id,
                        retry = retries_here,
                        backoff_ms = duration_millis(backoff),
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
                NextStep::Fallback => {
                    let Some(next) = self.next_fallback(&primary, &tried) else {
                        return Err(err);
                    };
                    tracing::info!(
                        request_id = %request_id,
                        from = %current.resource_id,
                        to = %next,
                        "Falling back"
                    );
                    tried.insert(next.clone());
                    current.resource_id = next;
                    retries_here = 0;
                }
                NextStep::GiveUp => return Err(err),
            }
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        request: &AdmissionRequest,
        request_id: &str,
        executor: F,
    ) -> Result<T, AdmissionError>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ExecutionError>> + Send + 'static,
    {
        if self.is_disposed() {
            return Err(AdmissionError::Disposed);
        }
        let resource_id = request.resource_id.as_str();

        self.policy.check(resource_id)?;
        if let Err(err) = self
            .limiter
            .acquire(resource_id, request.acquire_timeout)
            .await
        {
            // Never ran, so it cannot count as the half-open trial
            self.policy.release_trial(resource_id);
            return Err(err.into());
        }
        self.policy.record_request(resource_id);

        match self
            .scheduler
            .schedule(request.task_request(), executor)
            .join()
            .await
        {
            Ok(value) => {
                self.policy.record_success(resource_id);
                Ok(value)
            }
            Err(SchedulerError::Disposed) => Err(AdmissionError::Disposed),
            Err(err) => {
                let strategy = self.policy.handle_failure(resource_id, request_id, &err);
                self.policy.execute_strategy(resource_id, &strategy);
                Err(AdmissionError::Failed {
                    resource_id: resource_id.to_string(),
                    source: err,
                    strategy,
                })
            }
        }
    }

    /// First untried fallback of `primary` whose circuit admits traffic
    fn next_fallback(&self, primary: &str, tried: &HashSet<String>) -> Option<String> {
        self.fallbacks
            .read()
            .get(primary)?
            .iter()
            .filter(|candidate| !tried.contains(*candidate))
            .find(|candidate| self.policy.admits(candidate))
            .cloned()
    }

    /// Receive every event emitted by the components
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AdmissionEvent> {
        self.events.subscribe()
    }

    /// Combined statistics
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        let resources = self
            .limiter
            .resource_ids()
            .into_iter()
            .map(|resource_id| ResourceStats {
                limiter: self.limiter.get_status(&resource_id).ok(),
                policy: self.policy.snapshot(&resource_id),
                resource_id,
            })
            .collect();

        PipelineStats {
            scheduler: self.scheduler.get_metrics(),
            resources,
        }
    }

    /// The rate limiter
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The scheduler
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The failure policy
    #[must_use]
    pub fn policy(&self) -> &FailurePolicy {
        &self.policy
    }

    /// Pipeline settings
    #[must_use]
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Whether [`dispose`](Self::dispose) has been called
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Dispose every component and drop event subscribers; idempotent
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.limiter.dispose();
        self.scheduler.dispose();
        self.policy.dispose();
        self.fallbacks.write().clear();
        self.events.clear();
        tracing::info!("Admission pipeline disposed");
    }
}

impl std::fmt::Debug for AdmissionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPipeline")
            .field("limiter", &self.limiter)
            .field("scheduler", &self.scheduler)
            .field("policy", &self.policy)
            .field("settings", &self.settings)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn next_step(err: &AdmissionError, retries_here: u32) -> NextStep {
    match err {
        AdmissionError::Failed { strategy, .. } => {
            if strategy.allows_retry() && retries_here < strategy.max_attempts {
                NextStep::Retry(strategy.backoff)
            } else {
                NextStep::Fallback
            }
        }
        AdmissionError::CircuitOpen(_) => NextStep::Fallback,
        AdmissionError::RateLimited(RateLimitError::NotConfigured { .. } | RateLimitError::Disposed)
        | AdmissionError::Disposed => NextStep::GiveUp,
        AdmissionError::RateLimited(_) => NextStep::Fallback,
    }
}

// ============================================================================
// Tests
// ============================================================================
