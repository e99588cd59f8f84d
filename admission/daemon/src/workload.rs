//! Simulated model workload
//!
//! Spreads requests with random priorities over a set of resources and runs
//! them through the pipeline against executors that sleep and fail at a
//! configurable rate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use admission_core::clock::duration_millis;
use admission_core::{
    AdmissionError, AdmissionPipeline, AdmissionRequest, ExecutionError, Priority, TaskContext,
    TaskExecutor,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinSet;

const FAILURE_MESSAGES: &[&str] = &[
    "connection reset by peer",
    "model returned malformed output",
    "503 service unavailable",
    "context window exceeded",
];

/// Executor standing in for a model backend
#[derive(Clone, Debug)]
pub struct SimulatedModel {
    /// Mean latency; each call takes between half and one and a half times this
    pub latency: Duration,
    /// Probability in `0.0..=1.0` that a call fails
    pub failure_rate: f64,
}

#[async_trait]
impl TaskExecutor<String> for SimulatedModel {
    async fn execute(&self, ctx: TaskContext) -> Result<String, ExecutionError> {
        // ThreadRng is not Send, keep it out of the await points
        let (delay, failure) = {
            let mut rng = rand::thread_rng();
            let millis = duration_millis(self.latency);
            let delay = Duration::from_millis(rng.gen_range(millis / 2..=millis + millis / 2));
            let failure = if rng.gen_bool(self.failure_rate) {
                Some(FAILURE_MESSAGES[rng.gen_range(0..FAILURE_MESSAGES.len())])
            } else {
                None
            };
            (delay, failure)
        };

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = ctx.cancel.cancelled() => {
                return Err(ExecutionError::new("cancelled before completion"));
            }
        }

        match failure {
            Some(message) => Err(ExecutionError::new(message)),
            None => Ok(format!(
                "{} answered {} in {}ms",
                ctx.resource_id,
                ctx.task_id,
                delay.as_millis()
            )),
        }
    }
}

/// What to run
#[derive(Clone, Debug)]
pub struct WorkloadPlan {
    /// Requests to submit
    pub tasks: usize,
    /// Resources to spread requests over, round robin
    pub resources: Vec<String>,
    /// Use retries and fallbacks instead of single attempts
    pub recover: bool,
    /// Per-task execution timeout
    pub timeout: Option<Duration>,
}

/// Outcomes for one resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResourceCounts {
    /// Requests that produced a result
    pub succeeded: u64,
    /// Requests that ran and failed
    pub failed: u64,
    /// Requests refused before running
    pub rejected: u64,
}

/// Serializable summary of a run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadReport {
    /// Requests submitted
    pub submitted: u64,
    /// Requests that produced a result
    pub succeeded: u64,
    /// Requests that ran and failed
    pub failed: u64,
    /// Requests refused by the limiter or an open circuit
    pub rejected: u64,
    /// Outcomes keyed by the resource each request first targeted
    pub by_resource: BTreeMap<String, ResourceCounts>,
}

/// Outcome counters shared by the workload tasks
///
/// Survives an interrupted run so a partial report can still be printed.
#[derive(Debug, Default)]
pub struct WorkloadCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    by_resource: Mutex<BTreeMap<String, ResourceCounts>>,
}

impl WorkloadCounters {
    /// Snapshot the counters
    pub fn report(&self) -> WorkloadReport {
        WorkloadReport {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            by_resource: self.by_resource.lock().clone(),
        }
    }

    fn record(&self, resource_id: &str, outcome: &Result<String, AdmissionError>) {
        let (total, bump): (&AtomicU64, fn(&mut ResourceCounts)) = match outcome {
            Ok(_) => (&self.succeeded, |c| c.succeeded += 1),
            Err(AdmissionError::RateLimited(_) | AdmissionError::CircuitOpen(_)) => {
                (&self.rejected, |c| c.rejected += 1)
            }
            Err(_) => (&self.failed, |c| c.failed += 1),
        };
        total.fetch_add(1, Ordering::Relaxed);
        bump(self.by_resource.lock().entry(resource_id.to_string()).or_default());
    }
}

/// Submit every request of `plan` concurrently and wait for all of them
pub async fn run_workload(
    pipeline: AdmissionPipeline,
    model: SimulatedModel,
    plan: WorkloadPlan,
    counters: Arc<WorkloadCounters>,
) {
    if plan.resources.is_empty() {
        tracing::warn!("No resources to run against");
        return;
    }

    let mut set = JoinSet::new();

    for i in 0..plan.tasks {
        let resource_id = plan.resources[i % plan.resources.len()].clone();
        let priority = Priority::ALL[rand::thread_rng().gen_range(0..Priority::ALL.len())];
        let mut request = AdmissionRequest::new(resource_id.clone()).with_priority(priority);
        if let Some(timeout) = plan.timeout {
            request = request.with_timeout(timeout);
        }

        let pipeline = pipeline.clone();
        let model = model.clone();
        let counters = Arc::clone(&counters);
        let recover = plan.recover;
        counters.submitted.fetch_add(1, Ordering::Relaxed);

        set.spawn(async move {
            let outcome = if recover {
                pipeline.submit_with_recovery(request, model).await
            } else {
                pipeline
                    .submit(request, move |ctx| async move { model.execute(ctx).await })
                    .await
            };
            if let Err(err) = &outcome {
                tracing::debug!(resource = %resource_id, error = %err, "Request failed");
            }
            counters.record(&resource_id, &outcome);
        });
    }

    while let Some(joined) = set.join_next().await {
        if let Err(err) = joined {
            tracing::warn!(error = %err, "Workload task aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use admission_core::{AdmissionConfig, RateLimitConfig};

    fn pipeline(resources: &[&str]) -> AdmissionPipeline {
        let mut config = AdmissionConfig::default();
        config.pipeline.start_maintenance = false;
        config.failure_policy.base_backoff_ms = 1;
        for resource in resources {
            config = config.with_resource(
                *resource,
                RateLimitConfig::new()
                    .with_requests_per_second(1000.0)
                    .with_burst_limit(100),
            );
        }
        AdmissionPipeline::from_config(&config)
    }

    fn plan(tasks: usize, resources: &[&str], recover: bool) -> WorkloadPlan {
        WorkloadPlan {
            tasks,
            resources: resources.iter().map(ToString::to_string).collect(),
            recover,
            timeout: None,
        }
    }

    // ========================================================================
    // Executor Tests
    // ========================================================================

    #[tokio::test]
    async fn test_reliable_model_always_succeeds() {
        let pipeline = pipeline(&["a", "b"]);
        let counters = Arc::new(WorkloadCounters::default());
        let model = SimulatedModel {
            latency: Duration::from_millis(2),
            failure_rate: 0.0,
        };

        run_workload(
            pipeline.clone(),
            model,
            plan(12, &["a", "b"], false),
            Arc::clone(&counters),
        )
        .await;

        let report = counters.report();
        assert_eq!(report.submitted, 12);
        assert_eq!(report.succeeded, 12);
        assert_eq!(report.by_resource["a"].succeeded, 6);
        assert_eq!(report.by_resource["b"].succeeded, 6);
        assert_eq!(pipeline.scheduler().get_metrics().completed_tasks, 12);
        pipeline.dispose();
    }

    #[tokio::test]
    async fn test_broken_model_never_succeeds() {
        let pipeline = pipeline(&["a"]);
        let counters = Arc::new(WorkloadCounters::default());
        let model = SimulatedModel {
            latency: Duration::from_millis(1),
            failure_rate: 1.0,
        };

        run_workload(
            pipeline.clone(),
            model,
            plan(3, &["a"], false),
            Arc::clone(&counters),
        )
        .await;

        let report = counters.report();
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed + report.rejected, 3);
        assert!(!pipeline.policy().error_log("a").is_empty());
        pipeline.dispose();
    }

    // ========================================================================
    // Workload Tests
    // ========================================================================

    #[tokio::test]
    async fn test_unknown_resource_counts_as_rejected() {
        let pipeline = pipeline(&[]);
        let counters = Arc::new(WorkloadCounters::default());
        let model = SimulatedModel {
            latency: Duration::from_millis(1),
            failure_rate: 0.0,
        };

        run_workload(
            pipeline,
            model,
            plan(2, &["ghost"], true),
            Arc::clone(&counters),
        )
        .await;

        let report = counters.report();
        assert_eq!(report.rejected, 2);
        assert_eq!(report.by_resource["ghost"].rejected, 2);
    }

    #[tokio::test]
    async fn test_empty_resource_list_submits_nothing() {
        let counters = Arc::new(WorkloadCounters::default());
        let model = SimulatedModel {
            latency: Duration::from_millis(1),
            failure_rate: 0.0,
        };

        run_workload(pipeline(&[]), model, plan(5, &[], false), Arc::clone(&counters)).await;
        assert_eq!(counters.report(), WorkloadReport::default());
    }

    // ========================================================================
    // Counter Tests
    // ========================================================================

    #[test]
    fn test_counters_tally_per_resource() {
        let counters = WorkloadCounters::default();
        counters.record("a", &Ok("done".to_string()));
        counters.record("a", &Err(AdmissionError::Disposed));
        counters.record("b", &Ok("done".to_string()));

        let report = counters.report();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.rejected, 0);
        assert_eq!(
            report.by_resource["a"],
            ResourceCounts {
                succeeded: 1,
                failed: 1,
                rejected: 0,
            }
        );
        assert_eq!(report.by_resource["b"].succeeded, 1);
    }
}
