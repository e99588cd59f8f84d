//! Admission Events
//!
//! Typed notifications emitted by the rate limiter, scheduler and failure
//! policy engine. Consumers call [`EventBus::subscribe`] and read from an
//! unbounded channel; emitting never blocks the emitting component and
//! subscribers that have dropped their receiver are pruned on the next emit.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::tasks::{Priority, TaskId};

/// Which threshold a resource crossed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThresholdKind {
    /// Consecutive failures reached the circuit breaker threshold
    ConsecutiveFailures {
        /// Failures since the last success
        count: u32,
        /// Configured threshold
        threshold: u32,
    },
    /// Recorded attempts in the trailing minute exceeded the limit
    RequestRate {
        /// Attempts in the window
        count: usize,
        /// Configured per-minute limit
        limit: u32,
    },
}

/// Events emitted by the admission pipeline
#[derive(Clone, Debug, PartialEq)]
pub enum AdmissionEvent {
    // ============================================
    // Rate Limiter
    // ============================================
    /// An acquire could not be satisfied and was queued
    RequestQueued {
        /// Resource key
        resource_id: String,
        /// Queue entry id
        request_id: u64,
        /// Queue depth after the push
        queue_length: usize,
    },
    /// An acquire was granted a token
    RequestGranted {
        /// Resource key
        resource_id: String,
        /// Time spent queued (zero for immediate grants)
        waited: Duration,
    },

    // ============================================
    // Scheduler
    // ============================================
    /// A task entered a priority queue
    TaskScheduled {
        /// Task id
        task_id: TaskId,
        /// Resource key
        resource_id: String,
        /// Queue it entered
        priority: Priority,
    },
    /// A task took a concurrency slot
    TaskStarted {
        /// Task id
        task_id: TaskId,
        /// Resource key
        resource_id: String,
        /// Time spent queued
        waited: Duration,
    },
    /// A task's executor resolved
    TaskCompleted {
        /// Task id
        task_id: TaskId,
        /// Resource key
        resource_id: String,
        /// Execution time
        elapsed: Duration,
    },
    /// A task's executor failed or timed out
    TaskFailed {
        /// Task id
        task_id: TaskId,
        /// Resource key
        resource_id: String,
        /// Failure message
        error: String,
    },

    // ============================================
    // Failure Policy
    // ============================================
    /// The circuit for a resource opened
    CircuitOpened {
        /// Resource key
        resource_id: String,
        /// Failures that tripped it
        consecutive_failures: u32,
    },
    /// The reset timeout elapsed; a trial request is allowed
    CircuitHalfOpen {
        /// Resource key
        resource_id: String,
    },
    /// A success closed the circuit
    CircuitClosed {
        /// Resource key
        resource_id: String,
    },
    /// A failure or rate threshold was crossed
    ThresholdViolation {
        /// Resource key
        resource_id: String,
        /// What was crossed
        kind: ThresholdKind,
    },
    /// A throttle strategy was executed
    RequestThrottled {
        /// Resource key
        resource_id: String,
        /// Cooldown the caller should observe
        cooldown: Duration,
    },
}

impl AdmissionEvent {
    /// Resource the event refers to
    #[must_use]
    pub fn resource_id(&self) -> &str {
        match self {
            Self::RequestQueued { resource_id, .. }
            | Self::RequestGranted { resource_id, .. }
            | Self::TaskScheduled { resource_id, .. }
            | Self::TaskStarted { resource_id, .. }
            | Self::TaskCompleted { resource_id, .. }
            | Self::TaskFailed { resource_id, .. }
            | Self::CircuitOpened { resource_id, .. }
            | Self::CircuitHalfOpen { resource_id }
            | Self::CircuitClosed { resource_id }
            | Self::ThresholdViolation { resource_id, .. }
            | Self::RequestThrottled { resource_id, .. } => resource_id,
        }
    }

    /// Short event name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestQueued { .. } => "request_queued",
            Self::RequestGranted { .. } => "request_granted",
            Self::TaskScheduled { .. } => "task_scheduled",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitHalfOpen { .. } => "circuit_half_open",
            Self::CircuitClosed { .. } => "circuit_closed",
            Self::ThresholdViolation { .. } => "threshold_violation",
            Self::RequestThrottled { .. } => "request_throttled",
        }
    }
}

/// Fan-out of [`AdmissionEvent`]s to any number of subscribers
///
/// Cloning the bus shares the subscriber list.
#[derive(Clone, Debug, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<mpsc::UnboundedSender<AdmissionEvent>>>>,
}

impl EventBus {
    /// Create a bus with no subscribers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AdmissionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Deliver an event to every subscriber
    pub fn emit(&self, event: AdmissionEvent) {
        let mut stale = false;
        {
            let subscribers = self.subscribers.read();
            if subscribers.is_empty() {
                return;
            }
            for tx in subscribers.iter() {
                if tx.send(event.clone()).is_err() {
                    stale = true;
                }
            }
        }

        if stale {
            self.subscribers.write().retain(|tx| !tx.is_closed());
        }
    }

    /// Drop every subscriber
    pub fn clear(&self) {
        self.subscribers.write().clear();
    }
}
