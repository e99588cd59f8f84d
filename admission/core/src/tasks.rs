//! Task Types
//!
//! Identifiers, priorities and status records for units of work held by the
//! [`Scheduler`](crate::scheduler::Scheduler). The scheduler owns task state;
//! callers only see snapshots ([`TaskInfo`]).

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Task identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a task ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique task ID
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::time::{SystemTime, UNIX_EPOCH};

        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let count = COUNTER.fetch_add(1, Ordering::SeqCst);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        Self(format!("task_{timestamp}_{count}"))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatch priority
///
/// Dispatch is strictly ordered `High`, `Normal`, `Low`; there is no aging,
/// so a steady stream of high-priority work can starve the lower tiers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dispatched before everything else
    High,
    /// Default tier
    #[default]
    Normal,
    /// Dispatched only when no higher tier has pending work
    Low,
}

impl Priority {
    /// All priorities in dispatch order
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Queue index (0 is dispatched first)
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    /// Parse a priority name, falling back to `Normal`
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "high" | "urgent" => Self::High,
            "low" | "background" => Self::Low,
            _ => Self::Normal,
        }
    }

    /// Lowercase label
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle state of a scheduled task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in a priority queue
    Pending,
    /// Holding a concurrency slot
    Running,
    /// Executor resolved successfully
    Completed,
    /// Executor failed or the task timed out
    Failed,
    /// Removed from the queue before it started
    Cancelled,
}

impl TaskStatus {
    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Whether the task has settled
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot of a task's bookkeeping
#[derive(Clone, Debug)]
pub struct TaskInfo {
    /// Unique task id
    pub id: TaskId,
    /// Resource the task runs against
    pub resource_id: String,
    /// Dispatch priority
    pub priority: Priority,
    /// Current status
    pub status: TaskStatus,
    /// When the task entered its queue
    pub enqueued_at: Instant,
    /// When the task took a slot
    pub started_at: Option<Instant>,
    /// When the task settled
    pub finished_at: Option<Instant>,
    /// Soft execution timeout
    pub timeout: Option<Duration>,
    /// Failure message for failed tasks
    pub error: Option<String>,
}

impl TaskInfo {
    pub(crate) fn pending(
        resource_id: String,
        priority: Priority,
        timeout: Option<Duration>,
        now: Instant,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            resource_id,
            priority,
            status: TaskStatus::Pending,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            timeout,
            error: None,
        }
    }

    /// Time spent queued, if the task has started
    #[must_use]
    pub fn wait_time(&self) -> Option<Duration> {
        self.started_at
            .map(|started| started.saturating_duration_since(self.enqueued_at))
    }

    /// Time spent running, if the task has settled
    #[must_use]
    pub fn processing_time(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished.saturating_duration_since(started)),
            _ => None,
        }
    }
}
