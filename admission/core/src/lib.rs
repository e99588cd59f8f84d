//! Admission Core - Admission Control, Scheduling and Failure Recovery
//!
//! This crate sits between callers and model backends. It decides whether a
//! request may proceed now, later, or not at all, runs admitted work under a
//! concurrency cap, and turns failures into recovery decisions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        AdmissionPipeline                         │
//! │                                                                  │
//! │   request ──► FailurePolicy ──► RateLimiter ──► Scheduler ──► executor
//! │                 (circuit)      (tokens/quota)   (priority/cap)   │
//! │                     ▲                                 │          │
//! │                     └──── handle_failure ◄────────────┘          │
//! │                           RecoveryStrategy                       │
//! │                                                                  │
//! │   EventBus ◄── RequestQueued / TaskStarted / CircuitOpened / ... │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`RateLimiter`]: Token bucket, quota and FIFO wait queue per resource
//! - [`Scheduler`]: Priority queues under a global concurrency cap
//! - [`FailurePolicy`]: Circuit breaker, throttle window and recovery strategies
//! - [`AdmissionPipeline`]: The three composed into one request path
//! - [`EventBus`]: Typed lifecycle events for observers
//!
//! # Quick Start
//!
//! ```no_run
//! use admission_core::{
//!     AdmissionConfig, AdmissionPipeline, AdmissionRequest, ExecutionError, Priority,
//!     RateLimitConfig,
//! };
//!
//! # async fn demo() -> Result<(), admission_core::AdmissionError> {
//! let config = AdmissionConfig::default()
//!     .with_resource("llama3.2", RateLimitConfig::new().with_requests_per_second(5.0));
//! let pipeline = AdmissionPipeline::from_config(&config);
//!
//! let reply = pipeline
//!     .submit(
//!         AdmissionRequest::new("llama3.2").with_priority(Priority::High),
//!         |ctx| async move { Ok::<_, ExecutionError>(format!("answered on {}", ctx.resource_id)) },
//!     )
//!     .await?;
//!
//! pipeline.dispose();
//! # Ok(())
//! # }
//! ```
//!
//! # Module Overview
//!
//! - [`clock`]: Injectable monotonic time source
//! - [`config`]: TOML configuration with environment and CLI overrides
//! - [`error`]: Error taxonomy for every component
//! - [`events`]: Event types and the fan-out bus
//! - [`failure`]: Failure policy engine
//! - [`metrics`]: Latency histogram behind scheduler wait and processing percentiles
//! - [`periodic`]: Background interval tasks with deterministic shutdown
//! - [`pipeline`]: The composed admission path
//! - [`rate_limit`]: Per-resource rate limiting
//! - [`scheduler`]: Priority scheduling
//! - [`tasks`]: Task ids, priorities and task records

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod failure;
pub mod metrics;
pub mod periodic;
pub mod pipeline;
pub mod rate_limit;
pub mod scheduler;
pub mod tasks;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{
    AdmissionError, ExecutionError, PolicyError, RateLimitError, SchedulerError,
};
pub use events::{AdmissionEvent, EventBus, ThresholdKind};
pub use tasks::{Priority, TaskId, TaskInfo, TaskStatus};

// Component exports
pub use failure::{
    CircuitState, ErrorContext, FailurePolicy, FailurePolicyConfig, PolicySnapshot,
    RecoveryStrategy, StrategyKind,
};
pub use rate_limit::{LimiterSettings, RateLimitConfig, RateLimitStatus, RateLimiter};
pub use scheduler::{
    CancelOutcome, CancelSignal, Scheduler, SchedulerConfig, SchedulerMetrics, TaskContext,
    TaskHandle, TaskRequest,
};

// Pipeline exports
pub use pipeline::{
    AdmissionPipeline, AdmissionRequest, PipelineSettings, PipelineStats, ResourceStats,
    TaskExecutor,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, parse_config, AdmissionConfig,
    AdmissionToml, ConfigError, ConfigOverrides, ConfigSource,
};
