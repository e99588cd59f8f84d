//! Error Types
//!
//! Admission-layer errors ([`RateLimitError`], [`PolicyError`]) mean the work
//! was never started. Execution-layer errors ([`SchedulerError`]) surface
//! through a task handle once the work was admitted. [`AdmissionError`] is the
//! pipeline's umbrella over both.

use std::time::Duration;

use thiserror::Error;

use crate::failure::RecoveryStrategy;
use crate::tasks::TaskId;

// =============================================================================
// Rate Limiter
// =============================================================================

/// Errors returned by [`RateLimiter::acquire`](crate::rate_limit::RateLimiter::acquire)
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RateLimitError {
    /// No configuration was installed for the resource
    #[error("no rate limit configured for resource {resource_id}")]
    NotConfigured {
        /// Resource key
        resource_id: String,
    },

    /// The overflow queue is at capacity
    #[error("rate limit queue for {resource_id} is full (max: {max_queue_size})")]
    QueueFull {
        /// Resource key
        resource_id: String,
        /// Configured queue bound
        max_queue_size: usize,
    },

    /// The quota window is exhausted
    #[error("quota exceeded for {resource_id}, resets in {reset_in:?}")]
    QuotaExceeded {
        /// Resource key
        resource_id: String,
        /// Time until the window rolls over
        reset_in: Duration,
    },

    /// The request waited in the queue longer than its timeout
    #[error("rate limit wait for {resource_id} timed out after {timeout:?}")]
    Timeout {
        /// Resource key
        resource_id: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The stale sweep expired the request
    #[error("queued request for {resource_id} expired after {age:?}")]
    Expired {
        /// Resource key
        resource_id: String,
        /// Age when swept
        age: Duration,
    },

    /// The limiter was disposed
    #[error("rate limiter disposed")]
    Disposed,
}

impl RateLimitError {
    /// Whether retrying the acquire later could succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Expired { .. })
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Failure reported by an executor
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutionError {
    message: String,
}

impl ExecutionError {
    /// Create an execution error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Wrap any error, keeping its display text
    pub fn from_error(error: &dyn std::error::Error) -> Self {
        Self::new(error.to_string())
    }

    /// The failure message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ExecutionError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ExecutionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(format!("{error:#}"))
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Errors surfaced through a [`TaskHandle`](crate::scheduler::TaskHandle)
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SchedulerError {
    /// The executor did not settle within the task timeout
    #[error("task {task_id} timed out after {timeout:?}")]
    TaskTimeout {
        /// Task id
        task_id: TaskId,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The executor failed
    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    /// The task was cancelled while pending
    #[error("task {task_id} was cancelled")]
    Cancelled {
        /// Task id
        task_id: TaskId,
    },

    /// The scheduler was disposed
    #[error("scheduler disposed")]
    Disposed,
}

// =============================================================================
// Failure Policy
// =============================================================================

/// Errors from the failure policy admission gate
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PolicyError {
    /// Work is rejected while the circuit is open
    #[error("circuit open for {resource_id}, retry after {retry_after:?}")]
    CircuitOpen {
        /// Resource key
        resource_id: String,
        /// Remaining time until the circuit goes half-open
        retry_after: Duration,
    },
}

// =============================================================================
// Pipeline
// =============================================================================

/// Errors from [`AdmissionPipeline`](crate::pipeline::AdmissionPipeline)
#[derive(Clone, Debug, Error)]
pub enum AdmissionError {
    /// The rate limiter refused or timed out the request
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    /// The circuit for the resource is open
    #[error(transparent)]
    CircuitOpen(#[from] PolicyError),

    /// The task was admitted and failed; carries the recovery decision
    #[error("request to {resource_id} failed: {source}")]
    Failed {
        /// Resource the attempt ran against
        resource_id: String,
        /// Underlying task failure
        #[source]
        source: SchedulerError,
        /// Recovery strategy chosen for the failure
        strategy: RecoveryStrategy,
    },

    /// The pipeline was disposed
    #[error("admission pipeline disposed")]
    Disposed,
}

impl AdmissionError {
    /// Recovery strategy attached to an execution failure
    #[must_use]
    pub fn strategy(&self) -> Option<&RecoveryStrategy> {
        match self {
            Self::Failed { strategy, .. } => Some(strategy),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_error_display() {
        let err = RateLimitError::QueueFull {
            resource_id: "llama".into(),
            max_queue_size: 0,
        };
        assert!(err.to_string().contains("llama"));
        assert!(err.to_string().contains("max: 0"));
    }

    #[test]
    fn test_rate_limit_error_transient() {
        let timeout = RateLimitError::Timeout {
            resource_id: "m".into(),
            timeout: Duration::from_millis(5),
        };
        assert!(timeout.is_transient());
        assert!(!RateLimitError::Disposed.is_transient());
    }

    #[test]
    fn test_execution_error_conversions() {
        let from_str: ExecutionError = "boom".into();
        assert_eq!(from_str.message(), "boom");

        let from_anyhow: ExecutionError = anyhow::anyhow!("network unreachable").into();
        assert_eq!(from_anyhow.message(), "network unreachable");

        let wrapped = SchedulerError::from(from_str);
        assert_eq!(wrapped.to_string(), "execution failed: boom");
    }

    #[test]
    fn test_admission_error_from_layers() {
        let err: AdmissionError = RateLimitError::Disposed.into();
        assert!(matches!(err, AdmissionError::RateLimited(_)));
        assert!(err.strategy().is_none());
    }
}
