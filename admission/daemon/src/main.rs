//! Admission Daemon - Load driver for the admission core
//!
//! Builds an [`AdmissionPipeline`] from configuration, pushes a simulated
//! model workload through it and reports what the limiter, scheduler and
//! failure policy did.
//!
//! # Usage
//!
//! ```bash
//! # 100 requests over two models, 20% of calls failing
//! admission-daemon --tasks 100 --failure-rate 0.2
//!
//! # Retries and fallbacks, JSON report on stdout
//! admission-daemon --recover --json --resources llama3.2,qwen2.5
//!
//! # Explicit config file and a tighter concurrency cap
//! admission-daemon --config ./admission.toml --concurrency 2
//! ```
//!
//! # Signals
//!
//! - SIGINT (Ctrl+C): abandon outstanding requests, print a partial report
//!   and dispose the pipeline

mod workload;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use admission_core::{
    default_config_path, load_config_from_path, AdmissionConfig, AdmissionEvent,
    AdmissionPipeline, ConfigOverrides, PipelineStats, RateLimitConfig,
};
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::workload::{run_workload, SimulatedModel, WorkloadCounters, WorkloadPlan, WorkloadReport};

/// Admission Daemon - drive the admission core with a simulated workload
#[derive(Parser, Debug)]
#[command(name = "admission-daemon")]
#[command(about = "Admission control, scheduling and failure recovery load driver")]
#[command(version)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "ADMISSION_CONFIG")]
    config: Option<PathBuf>,

    /// Resources to spread requests over
    #[arg(long, value_delimiter = ',', default_value = "llama3.2,qwen2.5")]
    resources: Vec<String>,

    /// Number of requests to submit
    #[arg(short, long, default_value_t = 50)]
    tasks: usize,

    /// Override the scheduler concurrency cap
    #[arg(long)]
    concurrency: Option<usize>,

    /// Fraction of simulated calls that fail
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// Mean simulated call latency in milliseconds
    #[arg(long, default_value_t = 50)]
    latency_ms: u64,

    /// Per-task execution timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Retry and fall back instead of failing on the first error
    #[arg(long)]
    recover: bool,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "ADMISSION_LOG_LEVEL")]
    log_level: String,
}

#[derive(Debug, Error)]
enum ArgsError {
    #[error("failure rate must be within 0.0..=1.0, got {0}")]
    FailureRate(f64),

    #[error("at least one resource is required")]
    NoResources,
}

impl Args {
    fn validate(&self) -> Result<(), ArgsError> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ArgsError::FailureRate(self.failure_rate));
        }
        if self.resources.iter().all(|r| r.trim().is_empty()) {
            return Err(ArgsError::NoResources);
        }
        Ok(())
    }

    fn resource_ids(&self) -> Vec<String> {
        self.resources
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect()
    }

    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(max) = self.concurrency {
            overrides = overrides.with_max_concurrent_tasks(max);
        }
        overrides
    }
}

#[derive(Debug, Serialize)]
struct Report {
    interrupted: bool,
    workload: WorkloadReport,
    pipeline: PipelineStats,
}

/// Initialize logging
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "admission_daemon={level},admission_core={level}"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Resolve configuration: file, environment, then command line
///
/// Resources named on the command line but missing from the file get the
/// default rate limit.
fn resolve_config(args: &Args) -> Result<AdmissionConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    args.overrides().apply(&mut config);

    for resource_id in args.resource_ids() {
        if !config.resources.contains_key(&resource_id) {
            debug!(resource = %resource_id, "No rate limit configured, using defaults");
            config
                .resources
                .insert(resource_id, RateLimitConfig::default());
        }
    }

    config
        .validate()
        .context("Configuration invalid after applying command line overrides")?;
    Ok(config)
}

fn log_event(event: &AdmissionEvent) {
    match event {
        AdmissionEvent::CircuitOpened { .. }
        | AdmissionEvent::ThresholdViolation { .. }
        | AdmissionEvent::RequestThrottled { .. } => {
            warn!(event = event.name(), resource = event.resource_id(), "{event:?}");
        }
        AdmissionEvent::CircuitHalfOpen { .. } | AdmissionEvent::CircuitClosed { .. } => {
            info!(event = event.name(), resource = event.resource_id(), "{event:?}");
        }
        _ => debug!(event = event.name(), resource = event.resource_id(), "{event:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Admission Daemon"
    );

    args.validate()?;
    let config = resolve_config(&args)?;

    info!(
        source = %config.source(),
        resources = config.resources.len(),
        max_concurrent = config.scheduler.max_concurrent_tasks,
        "Configuration resolved"
    );

    let pipeline = AdmissionPipeline::from_config(&config);

    let mut events = pipeline.subscribe();
    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let model = SimulatedModel {
        latency: Duration::from_millis(args.latency_ms),
        failure_rate: args.failure_rate,
    };
    let plan = WorkloadPlan {
        tasks: args.tasks,
        resources: args.resource_ids(),
        recover: args.recover,
        timeout: args.timeout_ms.map(Duration::from_millis),
    };
    let counters = Arc::new(WorkloadCounters::default());

    info!(
        tasks = plan.tasks,
        resources = ?plan.resources,
        recover = plan.recover,
        "Running workload (Ctrl+C to stop)"
    );

    let interrupted = tokio::select! {
        () = run_workload(pipeline.clone(), model, plan, Arc::clone(&counters)) => false,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            warn!("Interrupted, abandoning outstanding requests");
            true
        }
    };

    let report = Report {
        interrupted,
        workload: counters.report(),
        pipeline: pipeline.stats(),
    };

    if args.json {
        let json =
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        println!("{json}");
    } else {
        let metrics = &report.pipeline.scheduler;
        info!(
            submitted = report.workload.submitted,
            succeeded = report.workload.succeeded,
            failed = report.workload.failed,
            rejected = report.workload.rejected,
            "Workload finished"
        );
        info!(
            completed = metrics.completed_tasks,
            failed = metrics.failed_tasks,
            cancelled = metrics.cancelled_tasks,
            peak_concurrency = metrics.peak_concurrency,
            p99_wait_ms = metrics.p99_wait_ms,
            p99_processing_ms = metrics.p99_processing_ms,
            throughput_per_sec = metrics.throughput_per_sec,
            "Scheduler metrics"
        );
        for resource in &report.pipeline.resources {
            if let Some(policy) = &resource.policy {
                info!(
                    resource = %resource.resource_id,
                    circuit = ?policy.circuit,
                    errors = policy.error_count,
                    "Resource state"
                );
            }
        }
    }

    pipeline.dispose();
    if let Err(e) = event_logger.await {
        warn!(error = %e, "Event logger task failed");
    }

    info!("Admission Daemon stopped");
    Ok(())
}
