//! Failure Classification and Circuit Breaking
//!
//! Turns execution failures into a [`RecoveryStrategy`] and runs a circuit
//! breaker and a sliding-window throttle detector per resource.
//!
//! # Circuit Breaker
//!
//! ```text
//! +--------+   failure_threshold    +------+     reset_timeout     +-----------+
//! | Closed | ---------------------> | Open | --------------------> | Half-Open |
//! +--------+  (circuit_break run)   +------+                       +-----------+
//!     ^                                ^                                 |
//!     |            success             |             failure             |
//!     +--------------------------------+---------------------------------+
//! ```
//!
//! Choosing a strategy never moves the circuit. Only
//! [`FailurePolicy::execute_strategy`] opens it, after which a timer (and a
//! lazy check against the clock) moves it to half-open once `reset_timeout`
//! has passed.
//!
//! # Strategy Selection
//!
//! 1. Circuit open, half-open, or consecutive failures at the threshold:
//!    `circuit_break`
//! 2. More than `max_requests_per_minute` recorded attempts in the trailing
//!    minute: `throttle`
//! 3. Transient failure (timeouts, network, rate limiting): `retry`
//! 4. Retry budget for the logical request spent: `fallback`
//! 5. Otherwise `retry`
//!
//! Backoff is linear: `base_backoff * min(error_log_len, 5)`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::clock::{duration_millis, SharedClock, SystemClock};
use crate::error::PolicyError;
use crate::events::{AdmissionEvent, EventBus, ThresholdKind};

/// Length of the sliding request window used for throttling
pub const THROTTLE_WINDOW: Duration = Duration::from_secs(60);

/// Backoff grows linearly with the error log up to this multiple
pub const MAX_BACKOFF_MULTIPLIER: u32 = 5;

// ============================================================================
// Strategy Types
// ============================================================================

/// Circuit breaker state for a resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    #[default]
    Closed,
    /// Requests are rejected until the reset timeout passes
    Open,
    /// Probing; the next outcome decides
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Kind of recovery the caller should perform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Try the same resource again after the backoff
    Retry,
    /// Move to an alternative resource
    Fallback,
    /// Stop sending to the resource until the circuit resets
    CircuitBreak,
    /// Slow down; wait out the cooldown
    Throttle,
}

/// Recovery decision for a failure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    /// What to do
    pub kind: StrategyKind,
    /// Attempts the caller may make under this strategy
    pub max_attempts: u32,
    /// Delay before the next attempt
    pub backoff: Duration,
    /// Time bound associated with the strategy (cooldown, reset or request timeout)
    pub timeout: Duration,
}

impl RecoveryStrategy {
    /// Whether the strategy allows another attempt against the same resource
    #[must_use]
    pub fn allows_retry(&self) -> bool {
        matches!(self.kind, StrategyKind::Retry | StrategyKind::Throttle) && self.max_attempts > 0
    }
}

/// One recorded failure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorContext {
    /// Logical request the failure belongs to
    pub request_id: String,
    /// Resource that failed
    pub resource_id: String,
    /// Failure message (including its source chain)
    pub message: String,
    /// When the failure was reported
    pub timestamp: Instant,
    /// Failures already recorded for this request before this one
    pub retry_count: u32,
}

// ============================================================================
// Configuration
// ============================================================================

/// Failure policy configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicyConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,

    /// How long the circuit stays open (milliseconds)
    pub reset_timeout_ms: u64,

    /// Recorded attempts per trailing minute before throttling
    pub max_requests_per_minute: u32,

    /// Cooldown handed out with throttle strategies (milliseconds)
    pub cooldown_period_ms: u64,

    /// Backoff unit (milliseconds)
    pub base_backoff_ms: u64,

    /// Retry budget per logical request
    pub max_retries: u32,

    /// Timeout attached to retry and fallback strategies (milliseconds)
    pub default_timeout_ms: u64,

    /// Error log retention (milliseconds)
    pub error_retention_ms: u64,

    /// Case-insensitive substrings marking a failure as transient
    pub transient_patterns: Vec<String>,
}

impl Default for FailurePolicyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            max_requests_per_minute: 60,
            cooldown_period_ms: 60_000,
            base_backoff_ms: 1_000,
            max_retries: 3,
            default_timeout_ms: 30_000,
            error_retention_ms: 24 * 60 * 60 * 1000,
            transient_patterns: default_transient_patterns(),
        }
    }
}

fn default_transient_patterns() -> Vec<String> {
    [
        "timeout",
        "timed out",
        "network",
        "connection",
        "econnreset",
        "econnrefused",
        "rate limit",
        "too many requests",
        "429",
        "503",
        "unavailable",
        "temporarily",
    ]
    .iter()
    .map(|p| (*p).to_string())
    .collect()
}

impl FailurePolicyConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the circuit breaker threshold and reset timeout
    #[must_use]
    pub fn with_circuit(mut self, failure_threshold: u32, reset_timeout: Duration) -> Self {
        self.failure_threshold = failure_threshold;
        self.reset_timeout_ms = duration_millis(reset_timeout);
        self
    }

    /// Set the throttle limit and cooldown
    #[must_use]
    pub fn with_throttle(mut self, max_requests_per_minute: u32, cooldown: Duration) -> Self {
        self.max_requests_per_minute = max_requests_per_minute;
        self.cooldown_period_ms = duration_millis(cooldown);
        self
    }

    /// Set the backoff unit
    #[must_use]
    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff_ms = duration_millis(base);
        self
    }

    /// Set the per-request retry budget
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Circuit reset timeout
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Throttle cooldown
    #[must_use]
    pub fn cooldown_period(&self) -> Duration {
        Duration::from_millis(self.cooldown_period_ms)
    }

    /// Backoff unit
    #[must_use]
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    /// Timeout for retry and fallback strategies
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Error log retention
    #[must_use]
    pub fn error_retention(&self) -> Duration {
        Duration::from_millis(self.error_retention_ms)
    }

    /// Whether a failure message matches a transient pattern
    #[must_use]
    pub fn is_transient(&self, message: &str) -> bool {
        let message = message.to_lowercase();
        self.transient_patterns
            .iter()
            .any(|pattern| message.contains(&pattern.to_lowercase()))
    }

    /// Linear backoff for an error log of `errors` entries
    #[must_use]
    pub fn backoff_for(&self, errors: usize) -> Duration {
        let multiplier = u32::try_from(errors)
            .unwrap_or(u32::MAX)
            .min(MAX_BACKOFF_MULTIPLIER);
        self.base_backoff().saturating_mul(multiplier)
    }

    fn retry(&self, backoff: Duration) -> RecoveryStrategy {
        RecoveryStrategy {
            kind: StrategyKind::Retry,
            max_attempts: self.max_retries,
            backoff,
            timeout: self.default_timeout(),
        }
    }

    fn fallback(&self) -> RecoveryStrategy {
        RecoveryStrategy {
            kind: StrategyKind::Fallback,
            max_attempts: 1,
            backoff: Duration::ZERO,
            timeout: self.default_timeout(),
        }
    }

    fn circuit_break(&self) -> RecoveryStrategy {
        RecoveryStrategy {
            kind: StrategyKind::CircuitBreak,
            max_attempts: 0,
            backoff: self.reset_timeout(),
            timeout: self.reset_timeout(),
        }
    }

    fn throttle(&self, backoff: Duration) -> RecoveryStrategy {
        RecoveryStrategy {
            kind: StrategyKind::Throttle,
            max_attempts: 1,
            backoff,
            timeout: self.cooldown_period(),
        }
    }
}

// ============================================================================
// Per-Resource State
// ============================================================================

/// Point-in-time view of a resource's failure state
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PolicySnapshot {
    /// Resource key
    pub resource_id: String,
    /// Circuit state
    pub circuit: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Entries in the retained error log
    pub error_count: usize,
    /// Attempts recorded in the trailing minute
    pub recent_requests: usize,
    /// Backoff the next failure would receive
    pub backoff: Duration,
    /// Time before [`FailurePolicy::check`] admits again: until an open
    /// circuit goes half-open, or until a half-open trial lapses
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Default)]
struct ResourceHealth {
    circuit: CircuitState,
    opened_at: Option<Instant>,
    generation: u64,
    consecutive_failures: u32,
    error_log: VecDeque<ErrorContext>,
    attempts: VecDeque<Instant>,
    reset_timer: Option<JoinHandle<()>>,
    /// When the current half-open trial request was admitted
    trial_started: Option<Instant>,
}

impl ResourceHealth {
    /// Apply an elapsed reset timeout
    fn refresh(&mut self, resource_id: &str, now: Instant, reset_timeout: Duration, events: &EventBus) {
        if self.circuit != CircuitState::Open {
            return;
        }
        let elapsed = self
            .opened_at
            .map_or(true, |opened| now.saturating_duration_since(opened) >= reset_timeout);
        if elapsed {
            self.enter_half_open(resource_id, events);
        }
    }

    fn enter_half_open(&mut self, resource_id: &str, events: &EventBus) {
        self.circuit = CircuitState::HalfOpen;
        self.trial_started = None;
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
        tracing::info!(resource = %resource_id, "Circuit breaker transitioning to half-open");
        events.emit(AdmissionEvent::CircuitHalfOpen {
            resource_id: resource_id.to_string(),
        });
    }

    fn retry_after(&self, now: Instant, reset_timeout: Duration) -> Option<Duration> {
        match self.circuit {
            CircuitState::Closed => None,
            CircuitState::Open => self
                .opened_at
                .map(|opened| (opened + reset_timeout).saturating_duration_since(now)),
            CircuitState::HalfOpen => self.live_trial(now, reset_timeout),
        }
    }

    /// Time left on the outstanding trial request's lease
    ///
    /// A trial that has not reported back within `reset_timeout` is treated
    /// as abandoned.
    fn live_trial(&self, now: Instant, reset_timeout: Duration) -> Option<Duration> {
        self.trial_started
            .map(|started| (started + reset_timeout).saturating_duration_since(now))
            .filter(|left| !left.is_zero())
    }

    fn prune_errors(&mut self, now: Instant, retention: Duration) {
        while self
            .error_log
            .front()
            .is_some_and(|e| now.saturating_duration_since(e.timestamp) > retention)
        {
            self.error_log.pop_front();
        }
    }

    fn recent_attempts(&mut self, now: Instant) -> usize {
        while self
            .attempts
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > THROTTLE_WINDOW)
        {
            self.attempts.pop_front();
        }
        self.attempts.len()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
    }
}

// ============================================================================
// Failure Policy Engine
// ============================================================================

struct PolicyInner {
    config: RwLock<FailurePolicyConfig>,
    resources: DashMap<String, ResourceHealth>,
    clock: SharedClock,
    events: EventBus,
    disposed: AtomicBool,
}

impl PolicyInner {
    /// Reset timer callback; ignored if the circuit reopened or closed since
    fn timer_fired(&self, resource_id: &str, generation: u64) {
        if let Some(mut health) = self.resources.get_mut(resource_id) {
            if health.circuit == CircuitState::Open && health.generation == generation {
                health.reset_timer = None;
                health.enter_half_open(resource_id, &self.events);
            }
        }
    }
}

fn arm_reset_timer(
    inner: Weak<PolicyInner>,
    resource_id: String,
    generation: u64,
    reset_timeout: Duration,
) -> Option<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    Some(runtime.spawn(async move {
        // reset_timeout elapsed: circuit may try again
        tokio::time::sleep(reset_timeout).await;
        if let Some(inner) = inner.upgrade() {
            inner.timer_fired(&resource_id, generation);
        }
    }))
}

/// Per-resource failure classification, circuit breaking and throttling
///
/// Cloning shares the underlying state.
#[derive(Clone)]
pub struct FailurePolicy {
    inner: Arc<PolicyInner>,
}

impl FailurePolicy {
    /// Create a failure policy engine
    #[must_use]
    pub fn new(config: FailurePolicyConfig, clock: SharedClock, events: EventBus) -> Self {
        Self {
            inner: Arc::new(PolicyInner {
                config: RwLock::new(config),
                resources: DashMap::new(),
                clock,
                events,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Create an engine with default configuration and the system clock
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(
            FailurePolicyConfig::default(),
            SystemClock::shared(),
            EventBus::new(),
        )
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> FailurePolicyConfig {
        self.inner.config.read().clone()
    }

    /// Replace the configuration; applies to future operations
    pub fn set_config(&self, config: FailurePolicyConfig) {
        *self.inner.config.write() = config;
    }

    /// Change the circuit breaker threshold and reset timeout
    pub fn set_thresholds(&self, failure_threshold: u32, reset_timeout: Duration) {
        let mut config = self.inner.config.write();
        config.failure_threshold = failure_threshold;
        config.reset_timeout_ms = duration_millis(reset_timeout);
    }

    /// Change the throttle limit and cooldown
    pub fn set_throttle(&self, max_requests_per_minute: u32, cooldown: Duration) {
        let mut config = self.inner.config.write();
        config.max_requests_per_minute = max_requests_per_minute;
        config.cooldown_period_ms = duration_millis(cooldown);
    }

    /// Record a failure and choose how to recover from it
    ///
    /// Never fails; the fallthrough decision is a plain retry. The circuit
    /// is not moved here, pass the result to
    /// [`execute_strategy`](Self::execute_strategy) for that.
    pub fn handle_failure(
        &self,
        resource_id: &str,
        request_id: &str,
        error: &dyn std::error::Error,
    ) -> RecoveryStrategy {
        let config = self.inner.config.read();
        if self.is_disposed() {
            tracing::debug!(resource = %resource_id, "Failure reported after dispose");
            return config.retry(config.base_backoff());
        }
        let events = &self.inner.events;
        let now = self.inner.clock.now();
        let message = error_chain(error);

        let mut health = self
            .inner
            .resources
            .entry(resource_id.to_string())
            .or_default();
        health.refresh(resource_id, now, config.reset_timeout(), events);

        let prior = health
            .error_log
            .iter()
            .filter(|e| e.request_id == request_id)
            .count();
        let retry_count = u32::try_from(prior).unwrap_or(u32::MAX);
        health.error_log.push_back(ErrorContext {
            request_id: request_id.to_string(),
            resource_id: resource_id.to_string(),
            message: message.clone(),
            timestamp: now,
            retry_count,
        });
        health.prune_errors(now, config.error_retention());
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.trial_started = None;

        let backoff = config.backoff_for(health.error_log.len());

        let circuit = health.circuit;
        let strategy = match circuit {
            CircuitState::Open => config.circuit_break(),
            CircuitState::HalfOpen => {
                tracing::debug!(resource = %resource_id, "Trial request failed while half-open");
                config.circuit_break()
            }
            CircuitState::Closed if health.consecutive_failures >= config.failure_threshold => {
                tracing::warn!(
                    resource = %resource_id,
                    consecutive_failures = health.consecutive_failures,
                    threshold = config.failure_threshold,
                    "Failure threshold reached"
                );
                events.emit(AdmissionEvent::ThresholdViolation {
                    resource_id: resource_id.to_string(),
                    kind: ThresholdKind::ConsecutiveFailures {
                        count: health.consecutive_failures,
                        threshold: config.failure_threshold,
                    },
                });
                config.circuit_break()
            }
            CircuitState::Closed => {
                let recent = health.recent_attempts(now);
                if recent > config.max_requests_per_minute as usize {
                    tracing::warn!(
                        resource = %resource_id,
                        recent_requests = recent,
                        limit = config.max_requests_per_minute,
                        "Request rate threshold exceeded"
                    );
                    events.emit(AdmissionEvent::ThresholdViolation {
                        resource_id: resource_id.to_string(),
                        kind: ThresholdKind::RequestRate {
                            count: recent,
                            limit: config.max_requests_per_minute,
                        },
                    });
                    config.throttle(backoff)
                } else if config.is_transient(&message) {
                    config.retry(backoff)
                } else if retry_count >= config.max_retries {
                    config.fallback()
                } else {
                    config.retry(backoff)
                }
            }
        };

        tracing::debug!(
            resource = %resource_id,
            request_id = %request_id,
            retry_count,
            strategy = ?strategy.kind,
            backoff_ms = duration_millis(strategy.backoff),
            error = %message,
            "Failure classified"
        );

        strategy
    }

    /// Apply the state changes a strategy implies
    ///
    /// `circuit_break` opens the circuit and arms the half-open timer;
    /// `throttle` records an attempt in the sliding window. `retry` and
    /// `fallback` change nothing.
    pub fn execute_strategy(&self, resource_id: &str, strategy: &RecoveryStrategy) {
        if self.is_disposed() {
            return;
        }
        match strategy.kind {
            StrategyKind::CircuitBreak => self.open_circuit(resource_id),
            StrategyKind::Throttle => {
                let now = self.inner.clock.now();
                self.inner
                    .resources
                    .entry(resource_id.to_string())
                    .or_default()
                    .attempts
                    .push_back(now);
                tracing::info!(
                    resource = %resource_id,
                    cooldown_ms = duration_millis(strategy.timeout),
                    "Throttling resource"
                );
                self.inner.events.emit(AdmissionEvent::RequestThrottled {
                    resource_id: resource_id.to_string(),
                    cooldown: strategy.timeout,
                });
            }
            StrategyKind::Retry | StrategyKind::Fallback => {
                tracing::trace!(resource = %resource_id, strategy = ?strategy.kind, "No state change for strategy");
            }
        }
    }

    fn open_circuit(&self, resource_id: &str) {
        let reset_timeout = self.inner.config.read().reset_timeout();
        let now = self.inner.clock.now();
        let mut health = self
            .inner
            .resources
            .entry(resource_id.to_string())
            .or_default();
        health.refresh(resource_id, now, reset_timeout, &self.inner.events);

        if health.circuit == CircuitState::Open {
            return;
        }

        health.circuit = CircuitState::Open;
        health.opened_at = Some(now);
        health.generation += 1;
        health.trial_started = None;
        health.cancel_timer();

        tracing::warn!(
            resource = %resource_id,
            consecutive_failures = health.consecutive_failures,
            reset_timeout_ms = duration_millis(reset_timeout),
            "Circuit breaker opened"
        );
        self.inner.events.emit(AdmissionEvent::CircuitOpened {
            resource_id: resource_id.to_string(),
            consecutive_failures: health.consecutive_failures,
        });

        if !self.inner.disposed.load(Ordering::SeqCst) {
            health.reset_timer = arm_reset_timer(
                Arc::downgrade(&self.inner),
                resource_id.to_string(),
                health.generation,
                reset_timeout,
            );
        }
    }

    /// Record a successful execution
    ///
    /// Clears the consecutive failure count and closes a half-open circuit.
    pub fn record_success(&self, resource_id: &str) {
        let reset_timeout = self.inner.config.read().reset_timeout();
        let now = self.inner.clock.now();
        let Some(mut health) = self.inner.resources.get_mut(resource_id) else {
            return;
        };
        health.refresh(resource_id, now, reset_timeout, &self.inner.events);
        health.consecutive_failures = 0;
        health.trial_started = None;

        if health.circuit == CircuitState::HalfOpen {
            health.circuit = CircuitState::Closed;
            health.opened_at = None;
            health.cancel_timer();
            tracing::info!(resource = %resource_id, "Circuit breaker closed");
            self.inner.events.emit(AdmissionEvent::CircuitClosed {
                resource_id: resource_id.to_string(),
            });
        }
    }

    /// Record an attempt in the sliding throttle window
    pub fn record_request(&self, resource_id: &str) {
        if self.is_disposed() {
            return;
        }
        let now = self.inner.clock.now();
        let mut health = self
            .inner
            .resources
            .entry(resource_id.to_string())
            .or_default();
        health.attempts.push_back(now);
        health.recent_attempts(now);
    }

    /// Admission gate: reject work while the circuit is open
    ///
    /// While half-open a single trial request is let through. Further calls
    /// are rejected until that trial reports back through
    /// [`record_success`](Self::record_success) or
    /// [`handle_failure`](Self::handle_failure), or until `reset_timeout`
    /// passes without a report.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::CircuitOpen`] with the time left until the
    /// circuit goes half-open, or until the outstanding trial lapses.
    pub fn check(&self, resource_id: &str) -> Result<(), PolicyError> {
        let reset_timeout = self.inner.config.read().reset_timeout();
        let now = self.inner.clock.now();
        let Some(mut health) = self.inner.resources.get_mut(resource_id) else {
            return Ok(());
        };
        health.refresh(resource_id, now, reset_timeout, &self.inner.events);

        if let Some(retry_after) = health.retry_after(now, reset_timeout) {
            return Err(PolicyError::CircuitOpen {
                resource_id: resource_id.to_string(),
                retry_after,
            });
        }
        if health.circuit == CircuitState::HalfOpen {
            health.trial_started = Some(now);
            tracing::debug!(resource = %resource_id, "Admitting half-open trial request");
        }
        Ok(())
    }

    /// Give back a half-open trial slot taken by [`check`](Self::check)
    /// for a request that never ran
    pub fn release_trial(&self, resource_id: &str) {
        if let Some(mut health) = self.inner.resources.get_mut(resource_id) {
            health.trial_started = None;
        }
    }

    /// Whether [`check`](Self::check) would admit a request right now
    ///
    /// Does not take the half-open trial slot.
    #[must_use]
    pub fn admits(&self, resource_id: &str) -> bool {
        let reset_timeout = self.inner.config.read().reset_timeout();
        let now = self.inner.clock.now();
        self.inner
            .resources
            .get_mut(resource_id)
            .map_or(true, |mut health| {
                health.refresh(resource_id, now, reset_timeout, &self.inner.events);
                health.retry_after(now, reset_timeout).is_none()
            })
    }

    /// Current circuit state (closed for unknown resources)
    #[must_use]
    pub fn circuit_state(&self, resource_id: &str) -> CircuitState {
        let reset_timeout = self.inner.config.read().reset_timeout();
        let now = self.inner.clock.now();
        self.inner
            .resources
            .get_mut(resource_id)
            .map_or(CircuitState::Closed, |mut health| {
                health.refresh(resource_id, now, reset_timeout, &self.inner.events);
                health.circuit
            })
    }

    /// Backoff the current error log implies
    #[must_use]
    pub fn compute_backoff(&self, resource_id: &str) -> Duration {
        let config = self.inner.config.read();
        let errors = self
            .inner
            .resources
            .get(resource_id)
            .map_or(0, |health| health.error_log.len());
        config.backoff_for(errors)
    }

    /// Snapshot of a resource's failure state
    #[must_use]
    pub fn snapshot(&self, resource_id: &str) -> Option<PolicySnapshot> {
        let config = self.inner.config.read();
        let now = self.inner.clock.now();
        let mut health = self.inner.resources.get_mut(resource_id)?;
        health.refresh(resource_id, now, config.reset_timeout(), &self.inner.events);

        Some(PolicySnapshot {
            resource_id: resource_id.to_string(),
            circuit: health.circuit,
            consecutive_failures: health.consecutive_failures,
            error_count: health.error_log.len(),
            recent_requests: health.recent_attempts(now),
            backoff: config.backoff_for(health.error_log.len()),
            retry_after: health.retry_after(now, config.reset_timeout()),
        })
    }

    /// Retained error log for a resource, oldest first
    #[must_use]
    pub fn error_log(&self, resource_id: &str) -> Vec<ErrorContext> {
        self.inner
            .resources
            .get(resource_id)
            .map(|health| health.error_log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget everything about a resource
    pub fn reset(&self, resource_id: &str) {
        if let Some((_, mut health)) = self.inner.resources.remove(resource_id) {
            health.cancel_timer();
            tracing::debug!(resource = %resource_id, "Failure state reset");
        }
    }

    /// Number of resources with recorded state
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.inner.resources.len()
    }

    /// Whether [`dispose`](Self::dispose) has been called
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Cancel timers and clear all state; idempotent
    pub fn dispose(&self) {
        let first = !self.inner.disposed.swap(true, Ordering::SeqCst);
        for mut health in self.inner.resources.iter_mut() {
            health.cancel_timer();
        }
        self.inner.resources.clear();
        if first {
            tracing::info!("Failure policy disposed");
        }
    }
}

impl std::fmt::Debug for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailurePolicy")
            .field("config", &*self.inner.config.read())
            .field("resources", &self.inner.resources.len())
            .finish()
    }
}

/// Display text of an error followed by its sources
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ExecutionError;
    use pretty_assertions::assert_eq;

    fn manual_policy(config: FailurePolicyConfig) -> (Arc<ManualClock>, FailurePolicy, EventBus) {
        let (manual, clock) = ManualClock::shared();
        let events = EventBus::new();
        let policy = FailurePolicy::new(config, clock, events.clone());
        (manual, policy, events)
    }

    fn fatal() -> ExecutionError {
        ExecutionError::new("model returned malformed output")
    }

    fn transient() -> ExecutionError {
        ExecutionError::new("connection reset by peer")
    }

    // ========================================================================
    // Classification Tests
    // ========================================================================

    #[test]
    fn test_config_defaults() {
        let config = FailurePolicyConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.error_retention(), Duration::from_secs(86_400));
        assert!(config.is_transient("Request TIMED OUT"));
        assert!(config.is_transient("HTTP 503 Service Unavailable"));
        assert!(!config.is_transient("invalid prompt"));
    }

    #[test]
    fn test_transient_failure_retries() {
        let (_, policy, _) = manual_policy(FailurePolicyConfig::default());
        let strategy = policy.handle_failure("m", "req-1", &transient());
        assert_eq!(
            strategy,
            RecoveryStrategy {
                kind: StrategyKind::Retry,
                max_attempts: 3,
                backoff: Duration::from_secs(1),
                timeout: Duration::from_secs(30),
            }
        );
        assert!(strategy.allows_retry());
    }

    #[test]
    fn test_fallback_after_retry_budget() {
        let config = FailurePolicyConfig::default().with_circuit(100, Duration::from_secs(60));
        let (_, policy, _) = manual_policy(config);

        for attempt in 0..3 {
            let strategy = policy.handle_failure("m", "req-1", &fatal());
            assert_eq!(strategy.kind, StrategyKind::Retry, "attempt {attempt}");
        }
        let strategy = policy.handle_failure("m", "req-1", &fatal());
        assert_eq!(strategy.kind, StrategyKind::Fallback);
        assert!(!strategy.allows_retry());

        // A different logical request starts with a fresh budget
        let other = policy.handle_failure("m", "req-2", &fatal());
        assert_eq!(other.kind, StrategyKind::Retry);

        let log = policy.error_log("m");
        assert_eq!(log.len(), 5);
        assert_eq!(log[3].retry_count, 3);
        assert_eq!(log[4].retry_count, 0);
    }

    #[test]
    fn test_backoff_linear_and_capped() {
        let config = FailurePolicyConfig::default().with_circuit(100, Duration::from_secs(60));
        let (_, policy, _) = manual_policy(config);
        assert_eq!(policy.compute_backoff("m"), Duration::ZERO);

        let first = policy.handle_failure("m", "a", &transient());
        assert_eq!(first.backoff, Duration::from_millis(1000));

        policy.handle_failure("m", "b", &transient());
        let third = policy.handle_failure("m", "c", &transient());
        assert_eq!(third.backoff, Duration::from_millis(3000));

        for id in ["d", "e", "f", "g"] {
            policy.handle_failure("m", id, &transient());
        }
        assert_eq!(policy.compute_backoff("m"), Duration::from_millis(5000));
    }

    #[test]
    fn test_error_chain_included() {
        #[derive(Debug, thiserror::Error)]
        #[error("upstream call failed")]
        struct Outer(#[source] ExecutionError);

        let err = Outer(ExecutionError::new("network unreachable"));
        let (_, policy, _) = manual_policy(FailurePolicyConfig::default());
        let strategy = policy.handle_failure("m", "r", &err);
        assert_eq!(strategy.kind, StrategyKind::Retry);
        assert_eq!(
            policy.error_log("m")[0].message,
            "upstream call failed: network unreachable"
        );
    }

    #[test]
    fn test_errors_pruned_after_retention() {
        let config = FailurePolicyConfig::default().with_circuit(100, Duration::from_secs(60));
        let (clock, policy, _) = manual_policy(config);
        policy.handle_failure("m", "a", &fatal());
        policy.handle_failure("m", "b", &fatal());

        clock.advance(Duration::from_secs(25 * 60 * 60));
        policy.handle_failure("m", "c", &fatal());
        assert_eq!(policy.error_log("m").len(), 1);
    }

    // ========================================================================
    // Circuit Breaker Tests
    // ========================================================================

    #[test]
    fn test_circuit_breaks_at_threshold() {
        let (_, policy, _) = manual_policy(FailurePolicyConfig::default());

        for i in 0..4 {
            let strategy = policy.handle_failure("m", &format!("r{i}"), &transient());
            assert_eq!(strategy.kind, StrategyKind::Retry);
        }
        let fifth = policy.handle_failure("m", "r4", &transient());
        assert_eq!(fifth.kind, StrategyKind::CircuitBreak);
        assert_eq!(fifth.max_attempts, 0);

        // Selecting the strategy did not open the circuit
        assert_eq!(policy.circuit_state("m"), CircuitState::Closed);

        let sixth = policy.handle_failure("m", "r5", &transient());
        assert_eq!(sixth.kind, StrategyKind::CircuitBreak);
    }

    #[test]
    fn test_open_half_open_closed_cycle() {
        let config = FailurePolicyConfig::default().with_circuit(2, Duration::from_secs(30));
        let (clock, policy, events) = manual_policy(config);
        let mut rx = events.subscribe();

        policy.handle_failure("m", "a", &fatal());
        let strategy = policy.handle_failure("m", "b", &fatal());
        assert_eq!(strategy.kind, StrategyKind::CircuitBreak);
        policy.execute_strategy("m", &strategy);
        assert_eq!(policy.circuit_state("m"), CircuitState::Open);

        let err = policy.check("m").unwrap_err();
        assert_eq!(
            err,
            PolicyError::CircuitOpen {
                resource_id: "m".into(),
                retry_after: Duration::from_secs(30)
            }
        );

        // While open, every failure keeps the circuit-break decision
        assert_eq!(
            policy.handle_failure("m", "c", &transient()).kind,
            StrategyKind::CircuitBreak
        );

        clock.advance(Duration::from_secs(30));
        assert_eq!(policy.circuit_state("m"), CircuitState::HalfOpen);
        assert!(policy.check("m").is_ok());

        policy.record_success("m");
        assert_eq!(policy.circuit_state("m"), CircuitState::Closed);
        assert_eq!(policy.snapshot("m").unwrap().consecutive_failures, 0);

        let names: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(
            names,
            vec![
                "threshold_violation",
                "circuit_opened",
                "circuit_half_open",
                "circuit_closed"
            ]
        );
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let config = FailurePolicyConfig::default().with_circuit(1, Duration::from_secs(10));
        let (clock, policy, _) = manual_policy(config);

        let strategy = policy.handle_failure("m", "a", &fatal());
        policy.execute_strategy("m", &strategy);
        clock.advance(Duration::from_secs(10));
        assert_eq!(policy.circuit_state("m"), CircuitState::HalfOpen);

        let trial = policy.handle_failure("m", "b", &transient());
        assert_eq!(trial.kind, StrategyKind::CircuitBreak);
        policy.execute_strategy("m", &trial);
        assert_eq!(policy.circuit_state("m"), CircuitState::Open);
        assert_eq!(
            policy.snapshot("m").unwrap().retry_after,
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_half_open_admits_one_trial_at_a_time() {
        let config = FailurePolicyConfig::default().with_circuit(1, Duration::from_secs(10));
        let (clock, policy, _) = manual_policy(config);

        let strategy = policy.handle_failure("m", "a", &fatal());
        policy.execute_strategy("m", &strategy);
        clock.advance(Duration::from_secs(10));

        // Querying does not take the trial slot
        assert!(policy.admits("m"));
        assert!(policy.admits("m"));

        assert!(policy.check("m").is_ok());
        assert!(!policy.admits("m"));
        clock.advance(Duration::from_secs(4));
        assert_eq!(
            policy.check("m").unwrap_err(),
            PolicyError::CircuitOpen {
                resource_id: "m".into(),
                retry_after: Duration::from_secs(6)
            }
        );
        assert_eq!(policy.circuit_state("m"), CircuitState::HalfOpen);

        policy.record_success("m");
        assert_eq!(policy.circuit_state("m"), CircuitState::Closed);
        assert!(policy.check("m").is_ok());
        assert!(policy.check("m").is_ok());
    }

    #[test]
    fn test_unreported_trial_lapses_after_reset_timeout() {
        let config = FailurePolicyConfig::default().with_circuit(1, Duration::from_secs(10));
        let (clock, policy, _) = manual_policy(config);

        let strategy = policy.handle_failure("m", "a", &fatal());
        policy.execute_strategy("m", &strategy);
        clock.advance(Duration::from_secs(10));

        assert!(policy.check("m").is_ok());
        assert!(policy.check("m").is_err());

        clock.advance(Duration::from_secs(10));
        assert!(policy.check("m").is_ok());
        assert!(policy.check("m").is_err());
    }

    #[test]
    fn test_released_trial_can_be_taken_again() {
        let config = FailurePolicyConfig::default().with_circuit(1, Duration::from_secs(10));
        let (clock, policy, _) = manual_policy(config);

        let strategy = policy.handle_failure("m", "a", &fatal());
        policy.execute_strategy("m", &strategy);
        clock.advance(Duration::from_secs(10));

        assert!(policy.check("m").is_ok());
        policy.release_trial("m");
        assert!(policy.check("m").is_ok());

        // A failed trial reopens the circuit
        let strategy = policy.handle_failure("m", "b", &fatal());
        policy.execute_strategy("m", &strategy);
        assert_eq!(policy.circuit_state("m"), CircuitState::Open);
        assert!(!policy.admits("m"));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (_, policy, _) = manual_policy(FailurePolicyConfig::default());
        for i in 0..4 {
            policy.handle_failure("m", &format!("r{i}"), &transient());
        }
        policy.record_success("m");
        assert_eq!(
            policy.handle_failure("m", "next", &transient()).kind,
            StrategyKind::Retry
        );
    }

    #[test]
    fn test_set_thresholds_applies_to_future_failures() {
        let (_, policy, _) = manual_policy(FailurePolicyConfig::default());
        policy.handle_failure("m", "a", &transient());
        policy.set_thresholds(2, Duration::from_secs(5));
        assert_eq!(
            policy.handle_failure("m", "b", &transient()).kind,
            StrategyKind::CircuitBreak
        );
        assert_eq!(policy.config().reset_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_reset_timer_moves_to_half_open() {
        let config = FailurePolicyConfig::default().with_circuit(1, Duration::from_millis(20));
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let policy = FailurePolicy::new(config, SystemClock::shared(), events);

        let strategy = policy.handle_failure("m", "a", &fatal());
        policy.execute_strategy("m", &strategy);

        let mut saw_half_open = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(AdmissionEvent::CircuitHalfOpen { resource_id })) => {
                    assert_eq!(resource_id, "m");
                    saw_half_open = true;
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {}
            }
        }
        assert!(saw_half_open);
        assert_eq!(policy.circuit_state("m"), CircuitState::HalfOpen);
    }

    // ========================================================================
    // Throttle Tests
    // ========================================================================

    #[test]
    fn test_throttle_when_rate_exceeded() {
        let config = FailurePolicyConfig::default()
            .with_throttle(2, Duration::from_secs(45))
            .with_circuit(100, Duration::from_secs(60));
        let (clock, policy, events) = manual_policy(config);
        let mut rx = events.subscribe();

        for _ in 0..3 {
            policy.record_request("m");
        }
        let strategy = policy.handle_failure("m", "a", &fatal());
        assert_eq!(strategy.kind, StrategyKind::Throttle);
        assert_eq!(strategy.timeout, Duration::from_secs(45));
        assert_eq!(strategy.backoff, Duration::from_secs(1));

        policy.execute_strategy("m", &strategy);
        assert_eq!(policy.snapshot("m").unwrap().recent_requests, 4);

        let received: Vec<AdmissionEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(received.iter().any(|e| matches!(
            e,
            AdmissionEvent::ThresholdViolation {
                kind: ThresholdKind::RequestRate { count: 3, limit: 2 },
                ..
            }
        )));
        assert!(received
            .iter()
            .any(|e| matches!(e, AdmissionEvent::RequestThrottled { .. })));

        clock.advance(THROTTLE_WINDOW + Duration::from_secs(1));
        assert_eq!(
            policy.handle_failure("m", "b", &transient()).kind,
            StrategyKind::Retry
        );
    }

    // ========================================================================
    // Lifecycle Tests
    // ========================================================================

    #[test]
    fn test_unknown_resource_defaults() {
        let policy = FailurePolicy::with_defaults();
        assert_eq!(policy.circuit_state("ghost"), CircuitState::Closed);
        assert!(policy.check("ghost").is_ok());
        assert!(policy.snapshot("ghost").is_none());
        policy.record_success("ghost");
        assert_eq!(policy.resource_count(), 0);
    }

    #[test]
    fn test_reset_forgets_resource() {
        let (_, policy, _) = manual_policy(FailurePolicyConfig::default());
        policy.handle_failure("m", "a", &fatal());
        policy.reset("m");
        assert!(policy.error_log("m").is_empty());
        assert_eq!(policy.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_dispose_twice_clears_state() {
        let config = FailurePolicyConfig::default().with_circuit(1, Duration::from_secs(60));
        let policy = FailurePolicy::new(config, SystemClock::shared(), EventBus::new());
        let strategy = policy.handle_failure("m", "a", &fatal());
        policy.execute_strategy("m", &strategy);

        policy.dispose();
        policy.dispose();
        assert_eq!(policy.resource_count(), 0);
        assert!(policy.is_disposed());
    }

    #[test]
    fn test_calls_after_dispose_leave_no_state() {
        let (_, policy, events) = manual_policy(
            FailurePolicyConfig::default().with_circuit(1, Duration::from_secs(60)),
        );
        let mut rx = events.subscribe();
        policy.dispose();

        policy.record_request("m");
        let strategy = policy.handle_failure("m", "a", &fatal());
        assert_eq!(strategy.kind, StrategyKind::Retry);
        policy.execute_strategy("m", &config_circuit_break());
        policy.record_success("m");

        assert_eq!(policy.resource_count(), 0);
        assert!(policy.error_log("m").is_empty());
        assert_eq!(policy.circuit_state("m"), CircuitState::Closed);
        assert!(rx.try_recv().is_err());
    }

    fn config_circuit_break() -> RecoveryStrategy {
        FailurePolicyConfig::default().circuit_break()
    }
}
