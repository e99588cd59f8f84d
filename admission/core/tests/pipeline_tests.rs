//! End-to-End Pipeline Tests
//!
//! Drive the composed pipeline from a TOML configuration through
//! concurrent load, timeouts, circuit breaking and fallback.

use std::time::Duration;

use admission_core::{
    parse_config, AdmissionError, AdmissionPipeline, AdmissionRequest, CircuitState,
    ExecutionError, SchedulerError, StrategyKind, TaskContext,
};
use tokio::task::JoinSet;

const CONFIG: &str = r#"
[scheduler]
max_concurrent_tasks = 3

[failure_policy]
failure_threshold = 2
reset_timeout_ms = 50
base_backoff_ms = 1
max_retries = 1

[pipeline]
max_total_attempts = 4
start_maintenance = true

[resources.primary]
requests_per_second = 1000.0
burst_limit = 50

[resources.backup]
requests_per_second = 1000.0
burst_limit = 50

[fallbacks]
primary = ["backup"]
"#;

fn pipeline() -> AdmissionPipeline {
    AdmissionPipeline::from_config(&parse_config(CONFIG).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_complete_under_cap() {
    let pipeline = pipeline();
    let mut set = JoinSet::new();

    for i in 0..30 {
        let pipeline = pipeline.clone();
        let resource = if i % 2 == 0 { "primary" } else { "backup" };
        set.spawn(async move {
            pipeline
                .submit(AdmissionRequest::new(resource), move |_| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<_, ExecutionError>(i)
                })
                .await
        });
    }

    let mut completed = 0;
    while let Some(joined) = set.join_next().await {
        joined.unwrap().unwrap();
        completed += 1;
    }

    let stats = pipeline.stats();
    assert_eq!(completed, 30);
    assert_eq!(stats.scheduler.completed_tasks, 30);
    assert!(stats.scheduler.peak_concurrency <= 3);
    assert_eq!(stats.resources.len(), 2);
    pipeline.dispose();
}

#[tokio::test]
async fn timeout_surfaces_as_failure_with_retry_strategy() {
    let pipeline = pipeline();
    let err = pipeline
        .submit(
            AdmissionRequest::new("primary").with_timeout(Duration::from_millis(20)),
            |_| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, ExecutionError>(())
            },
        )
        .await
        .unwrap_err();

    match err {
        AdmissionError::Failed {
            source, strategy, ..
        } => {
            assert!(matches!(source, SchedulerError::TaskTimeout { .. }));
            assert_eq!(strategy.kind, StrategyKind::Retry);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    pipeline.dispose();
}

#[tokio::test]
async fn circuit_opens_half_opens_and_closes() {
    let pipeline = pipeline();
    let mut events = pipeline.subscribe();

    for _ in 0..2 {
        let _ = pipeline
            .submit(AdmissionRequest::new("primary"), |_| async move {
                Err::<(), _>(ExecutionError::new("malformed completion"))
            })
            .await;
    }
    assert_eq!(pipeline.policy().circuit_state("primary"), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(
        pipeline.policy().circuit_state("primary"),
        CircuitState::HalfOpen
    );

    pipeline
        .submit(AdmissionRequest::new("primary"), |_| async move {
            Ok::<_, ExecutionError>(())
        })
        .await
        .unwrap();
    assert_eq!(
        pipeline.policy().circuit_state("primary"),
        CircuitState::Closed
    );

    let names: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| e.name())
        .collect();
    let position = |name: &str| names.iter().position(|n| *n == name);
    let opened = position("circuit_opened").unwrap();
    let half_open = position("circuit_half_open").unwrap();
    let closed = position("circuit_closed").unwrap();
    assert!(opened < half_open && half_open < closed);
    pipeline.dispose();
}

#[tokio::test]
async fn recovery_moves_to_backup_when_primary_keeps_failing() {
    let pipeline = pipeline();

    let served_by = pipeline
        .submit_with_recovery(AdmissionRequest::new("primary"), |ctx: TaskContext| async move {
            if ctx.resource_id == "primary" {
                Err(ExecutionError::new("primary rejected the prompt"))
            } else {
                Ok(ctx.resource_id)
            }
        })
        .await
        .unwrap();

    assert_eq!(served_by, "backup");
    assert_eq!(pipeline.policy().error_log("primary").len(), 2);
    pipeline.dispose();
}
