//! Per-Resource Rate Limiting
//!
//! Bounds how fast requests are admitted for each resource (model) key. It
//! implements:
//!
//! - A token bucket per resource with continuous refill
//! - An optional coarse quota per time window
//! - A bounded FIFO overflow queue for requests that arrive with no tokens
//! - Per-request wait timeouts and a periodic stale-request sweep
//!
//! # Design
//!
//! - Tokens refill continuously at `requests_per_second`, capped at
//!   `burst_limit`; each grant consumes one token
//! - The quota is checked before tokens and is never queued: an exhausted
//!   window fails fast with [`RateLimitError::QuotaExceeded`]
//! - Queued requests are granted strictly in arrival order; a new caller
//!   never overtakes a queued one
//! - Each queued request ends exactly once: granted, timed out, expired by
//!   the sweep, or rejected by [`RateLimiter::dispose`]
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use admission_core::rate_limit::{RateLimitConfig, RateLimiter};
//!
//! # async fn demo() -> Result<(), admission_core::RateLimitError> {
//! let limiter = RateLimiter::with_defaults();
//! limiter.configure(
//!     "llama3.2",
//!     RateLimitConfig::new().with_requests_per_second(5.0).with_burst_limit(10),
//! );
//!
//! limiter.acquire("llama3.2", Some(Duration::from_secs(2))).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::clock::{duration_millis, SharedClock, SystemClock};
use crate::error::RateLimitError;
use crate::events::{AdmissionEvent, EventBus};
use crate::periodic::PeriodicTask;

/// Shortest pause between refill checks while a request waits
const MIN_REFILL_POLL: Duration = Duration::from_millis(1);

/// Longest pause between refill checks while a request waits
const MAX_REFILL_POLL: Duration = Duration::from_millis(250);

// =============================================================================
// Configuration
// =============================================================================

/// Rate limit configuration for one resource
///
/// Fields left out of a TOML section or struct literal take the defaults
/// below.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Steady-state refill rate
    pub requests_per_second: f64,

    /// Bucket capacity; also the initial token count
    pub burst_limit: u32,

    /// Maximum queued requests (0 disables queueing)
    pub max_queue_size: usize,

    /// Requests allowed per quota window (`None` disables the quota)
    pub quota_limit: Option<u64>,

    /// Quota window length in milliseconds
    pub time_window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_limit: 20,
            max_queue_size: 100,
            quota_limit: None,
            time_window_ms: 3_600_000,
        }
    }
}

impl RateLimitConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the refill rate
    #[must_use]
    pub fn with_requests_per_second(mut self, rate: f64) -> Self {
        self.requests_per_second = rate;
        self
    }

    /// Set the bucket capacity
    #[must_use]
    pub fn with_burst_limit(mut self, burst: u32) -> Self {
        self.burst_limit = burst;
        self
    }

    /// Set the overflow queue bound
    #[must_use]
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Enable a quota of `limit` requests per `window`
    #[must_use]
    pub fn with_quota(mut self, limit: u64, window: Duration) -> Self {
        self.quota_limit = Some(limit);
        self.time_window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Quota window length
    #[must_use]
    pub fn time_window(&self) -> Duration {
        Duration::from_millis(self.time_window_ms)
    }

    fn burst(&self) -> f64 {
        f64::from(self.burst_limit)
    }

    fn refill_rate(&self) -> f64 {
        if self.requests_per_second.is_finite() {
            self.requests_per_second.max(0.0)
        } else {
            0.0
        }
    }
}

/// Limiter-wide settings shared by all resources
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Wait timeout for `acquire` when the caller gives none
    pub default_acquire_timeout_ms: u64,

    /// Queued requests older than this are expired by the sweep
    pub stale_after_ms: u64,

    /// How often the stale sweep runs
    pub sweep_interval_ms: u64,

    /// How often the background drain grants queued requests
    pub drain_interval_ms: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            default_acquire_timeout_ms: 5_000,
            stale_after_ms: 300_000,
            sweep_interval_ms: 60_000,
            drain_interval_ms: 100,
        }
    }
}

impl LimiterSettings {
    /// Short intervals for tests
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            default_acquire_timeout_ms: 1_000,
            stale_after_ms: 20,
            sweep_interval_ms: 10,
            drain_interval_ms: 5,
        }
    }

    /// Default acquire timeout
    #[must_use]
    pub fn default_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.default_acquire_timeout_ms)
    }

    /// Stale request threshold
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Read-only snapshot of one resource's limiter state
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RateLimitStatus {
    /// Tokens available now (fractional)
    pub tokens: f64,
    /// Requests waiting in the overflow queue
    pub queue_length: usize,
    /// Requests left in the current quota window
    pub quota_remaining: Option<u64>,
    /// Time until the quota window rolls over; the full window before the
    /// first acquire opens one
    pub quota_reset_in: Option<Duration>,
    /// Requests granted since configuration
    pub granted: u64,
    /// Requests that had to queue
    pub queued: u64,
    /// Requests refused, timed out or expired
    pub rejected: u64,
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug)]
struct QuotaWindow {
    remaining: u64,
    reset_at: Instant,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    quota: Option<QuotaWindow>,
}

impl TokenBucket {
    fn full(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.burst(),
            last_refill: now,
            quota: None,
        }
    }

    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        self.tokens = self.projected(config, now);
        self.last_refill = self.last_refill.max(now);
    }

    /// Token count at `now` without mutating the bucket
    fn projected(&self, config: &RateLimitConfig, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * config.refill_rate()).min(config.burst())
    }
}

#[derive(Debug)]
struct QueuedRequest {
    id: u64,
    enqueued_at: Instant,
    responder: oneshot::Sender<Result<(), RateLimitError>>,
}

enum Admission {
    Granted,
    Queued {
        request_id: u64,
        rx: oneshot::Receiver<Result<(), RateLimitError>>,
    },
}

#[derive(Debug)]
struct ResourceState {
    config: RateLimitConfig,
    bucket: Option<TokenBucket>,
    queue: VecDeque<QueuedRequest>,
    granted: u64,
    queued: u64,
    rejected: u64,
}

impl ResourceState {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            bucket: None,
            queue: VecDeque::new(),
            granted: 0,
            queued: 0,
            rejected: 0,
        }
    }

    fn refill(&mut self, now: Instant) {
        let config = &self.config;
        self.bucket
            .get_or_insert_with(|| TokenBucket::full(config, now))
            .refill(config, now);
    }

    /// Grant queue heads while whole tokens are available
    fn drain(&mut self, resource_id: &str, now: Instant, events: &EventBus) -> usize {
        self.refill(now);
        let Some(bucket) = self.bucket.as_mut() else {
            return 0;
        };

        let mut granted = 0;
        while bucket.tokens >= 1.0 {
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            if request.responder.is_closed() {
                continue;
            }

            bucket.tokens -= 1.0;
            let waited = now.saturating_duration_since(request.enqueued_at);
            if request.responder.send(Ok(())).is_err() {
                bucket.tokens += 1.0;
                continue;
            }

            self.granted += 1;
            granted += 1;
            tracing::trace!(
                resource = %resource_id,
                request_id = request.id,
                waited_ms = duration_millis(waited),
                "Queued request granted"
            );
            events.emit(AdmissionEvent::RequestGranted {
                resource_id: resource_id.to_string(),
                waited,
            });
        }
        granted
    }

    fn admit(
        &mut self,
        resource_id: &str,
        now: Instant,
        request_id: u64,
        events: &EventBus,
    ) -> Result<Admission, RateLimitError> {
        self.queue.retain(|request| !request.responder.is_closed());
        self.drain(resource_id, now, events);

        let config = &self.config;
        let bucket = self
            .bucket
            .get_or_insert_with(|| TokenBucket::full(config, now));

        if let Some(limit) = config.quota_limit {
            let window = config.time_window();
            let quota = bucket.quota.get_or_insert(QuotaWindow {
                remaining: limit,
                reset_at: now + window,
            });
            if now > quota.reset_at {
                quota.remaining = limit;
                quota.reset_at = now + window;
            }
            quota.remaining = quota.remaining.min(limit);

            if quota.remaining == 0 {
                self.rejected += 1;
                return Err(RateLimitError::QuotaExceeded {
                    resource_id: resource_id.to_string(),
                    reset_in: quota.reset_at.saturating_duration_since(now),
                });
            }
            quota.remaining -= 1;
        }

        if self.queue.is_empty() && bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            self.granted += 1;
            events.emit(AdmissionEvent::RequestGranted {
                resource_id: resource_id.to_string(),
                waited: Duration::ZERO,
            });
            return Ok(Admission::Granted);
        }

        if self.queue.len() >= config.max_queue_size {
            self.rejected += 1;
            tracing::debug!(
                resource = %resource_id,
                max_queue_size = config.max_queue_size,
                "Rate limit queue full"
            );
            return Err(RateLimitError::QueueFull {
                resource_id: resource_id.to_string(),
                max_queue_size: config.max_queue_size,
            });
        }

        let (responder, rx) = oneshot::channel();
        self.queue.push_back(QueuedRequest {
            id: request_id,
            enqueued_at: now,
            responder,
        });
        self.queued += 1;

        tracing::debug!(
            resource = %resource_id,
            request_id,
            queue_length = self.queue.len(),
            "Request queued for tokens"
        );
        events.emit(AdmissionEvent::RequestQueued {
            resource_id: resource_id.to_string(),
            request_id,
            queue_length: self.queue.len(),
        });

        Ok(Admission::Queued { request_id, rx })
    }

    fn status(&self, now: Instant) -> RateLimitStatus {
        let tokens = self
            .bucket
            .as_ref()
            .map_or(self.config.burst(), |bucket| bucket.projected(&self.config, now));
        let live_quota = self
            .bucket
            .as_ref()
            .and_then(|bucket| bucket.quota.as_ref())
            .filter(|quota| now <= quota.reset_at);

        let quota_remaining = self.config.quota_limit.map(|limit| {
            live_quota.map_or(limit, |quota| quota.remaining.min(limit))
        });
        // No live window yet: the next acquire opens a full one
        let quota_reset_in = self.config.quota_limit.map(|_| {
            live_quota.map_or(self.config.time_window(), |quota| {
                quota.reset_at.saturating_duration_since(now)
            })
        });

        RateLimitStatus {
            tokens,
            queue_length: self.queue.len(),
            quota_remaining,
            quota_reset_in,
            granted: self.granted,
            queued: self.queued,
            rejected: self.rejected,
        }
    }

    /// Delay until the next whole token is expected
    fn refill_delay(&self, now: Instant) -> Duration {
        let tokens = self
            .bucket
            .as_ref()
            .map_or(self.config.burst(), |bucket| bucket.projected(&self.config, now));
        if tokens >= 1.0 {
            return MIN_REFILL_POLL;
        }

        let rate = self.config.refill_rate();
        if rate <= 0.0 {
            return MAX_REFILL_POLL;
        }
        Duration::try_from_secs_f64((1.0 - tokens) / rate)
            .unwrap_or(MAX_REFILL_POLL)
            .clamp(MIN_REFILL_POLL, MAX_REFILL_POLL)
    }
}

// =============================================================================
// Rate Limiter
// =============================================================================

struct LimiterInner {
    settings: LimiterSettings,
    resources: Mutex<HashMap<String, ResourceState>>,
    clock: SharedClock,
    events: EventBus,
    next_request_id: AtomicU64,
    disposed: AtomicBool,
    maintenance: Mutex<Vec<PeriodicTask>>,
}

impl LimiterInner {
    fn drain(&self, resource_id: &str) -> usize {
        let now = self.clock.now();
        let mut resources = self.resources.lock();
        resources
            .get_mut(resource_id)
            .map_or(0, |state| state.drain(resource_id, now, &self.events))
    }

    fn drain_all(&self) -> usize {
        let now = self.clock.now();
        let mut resources = self.resources.lock();
        resources
            .iter_mut()
            .filter(|(_, state)| !state.queue.is_empty())
            .map(|(resource_id, state)| state.drain(resource_id, now, &self.events))
            .sum()
    }

    fn sweep_stale(&self) -> usize {
        let stale_after = self.settings.stale_after();
        let now = self.clock.now();
        let mut expired = 0;

        let mut resources = self.resources.lock();
        for (resource_id, state) in resources.iter_mut() {
            let mut kept = VecDeque::with_capacity(state.queue.len());
            while let Some(request) = state.queue.pop_front() {
                let age = now.saturating_duration_since(request.enqueued_at);
                if age > stale_after {
                    let _ = request.responder.send(Err(RateLimitError::Expired {
                        resource_id: resource_id.clone(),
                        age,
                    }));
                    state.rejected += 1;
                    expired += 1;
                } else {
                    kept.push_back(request);
                }
            }
            state.queue = kept;
        }
        drop(resources);

        if expired > 0 {
            tracing::warn!(
                expired,
                stale_after_ms = self.settings.stale_after_ms,
                "Expired stale rate limit requests"
            );
        }
        expired
    }

    /// Settle a request whose wait deadline passed
    fn abandon(
        &self,
        resource_id: &str,
        request_id: u64,
        rx: &mut oneshot::Receiver<Result<(), RateLimitError>>,
        timeout: Duration,
    ) -> Result<(), RateLimitError> {
        {
            let mut resources = self.resources.lock();
            if let Some(state) = resources.get_mut(resource_id) {
                if let Some(pos) = state.queue.iter().position(|r| r.id == request_id) {
                    state.queue.remove(pos);
                    state.rejected += 1;
                    tracing::debug!(
                        resource = %resource_id,
                        request_id,
                        timeout_ms = duration_millis(timeout),
                        "Queued request timed out"
                    );
                    return Err(RateLimitError::Timeout {
                        resource_id: resource_id.to_string(),
                        timeout,
                    });
                }
            }
        }

        // Already settled by a drain, sweep or dispose
        rx.try_recv().unwrap_or(Err(RateLimitError::Disposed))
    }

    fn refill_delay(&self, resource_id: &str) -> Duration {
        let now = self.clock.now();
        self.resources
            .lock()
            .get(resource_id)
            .map_or(MAX_REFILL_POLL, |state| state.refill_delay(now))
    }
}

/// Token-bucket admission control keyed by resource
///
/// Cloning shares the underlying state.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    /// Create a limiter
    #[must_use]
    pub fn new(settings: LimiterSettings, clock: SharedClock, events: EventBus) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                settings,
                resources: Mutex::new(HashMap::new()),
                clock,
                events,
                next_request_id: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
                maintenance: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a limiter with default settings and the system clock
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(LimiterSettings::default(), SystemClock::shared(), EventBus::new())
    }

    /// Limiter-wide settings
    #[must_use]
    pub fn settings(&self) -> &LimiterSettings {
        &self.inner.settings
    }

    /// Install or replace the configuration for a resource
    ///
    /// An existing bucket keeps its tokens (clamped to the new burst limit)
    /// and its queue.
    pub fn configure(&self, resource_id: impl Into<String>, config: RateLimitConfig) {
        let resource_id = resource_id.into();
        if self.inner.disposed.load(Ordering::SeqCst) {
            tracing::warn!(resource = %resource_id, "Ignoring configure on disposed rate limiter");
            return;
        }

        tracing::debug!(
            resource = %resource_id,
            rps = config.requests_per_second,
            burst = config.burst_limit,
            max_queue = config.max_queue_size,
            quota = ?config.quota_limit,
            "Configuring rate limit"
        );

        let now = self.inner.clock.now();
        let mut resources = self.inner.resources.lock();
        match resources.get_mut(&resource_id) {
            Some(state) => {
                if let Some(bucket) = state.bucket.as_mut() {
                    bucket.refill(&state.config, now);
                    bucket.tokens = bucket.tokens.min(config.burst());
                }
                state.config = config;
            }
            None => {
                resources.insert(resource_id, ResourceState::new(config));
            }
        }
    }

    /// Whether a resource has a configuration
    #[must_use]
    pub fn is_configured(&self, resource_id: &str) -> bool {
        self.inner.resources.lock().contains_key(resource_id)
    }

    /// Configuration currently installed for a resource
    #[must_use]
    pub fn config(&self, resource_id: &str) -> Option<RateLimitConfig> {
        self.inner
            .resources
            .lock()
            .get(resource_id)
            .map(|state| state.config.clone())
    }

    /// Number of configured resources
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.inner.resources.lock().len()
    }

    /// Configured resource ids, sorted
    #[must_use]
    pub fn resource_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.resources.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Wait for permission to send one request to `resource_id`
    ///
    /// Returns immediately when a token is available. Otherwise the request
    /// joins the resource's FIFO queue and waits up to `timeout` (the
    /// limiter's default when `None`).
    ///
    /// # Errors
    ///
    /// - [`RateLimitError::NotConfigured`] for unknown resources
    /// - [`RateLimitError::QuotaExceeded`] when the quota window is spent
    /// - [`RateLimitError::QueueFull`] when no token is available and the
    ///   queue is at capacity
    /// - [`RateLimitError::Timeout`] / [`RateLimitError::Expired`] when the
    ///   queued request is not granted in time
    /// - [`RateLimitError::Disposed`] after [`dispose`](Self::dispose)
    pub async fn acquire(
        &self,
        resource_id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), RateLimitError> {
        let timeout = timeout.unwrap_or_else(|| self.inner.settings.default_acquire_timeout());

        let (request_id, mut rx) = match self.admit(resource_id)? {
            Admission::Granted => return Ok(()),
            Admission::Queued { request_id, rx } => (request_id, rx),
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let refill_wait = self.inner.refill_delay(resource_id);
            tokio::select! {
                biased;
                outcome = &mut rx => {
                    return outcome.unwrap_or(Err(RateLimitError::Disposed));
                }
                () = tokio::time::sleep_until(deadline) => {
                    return self.inner.abandon(resource_id, request_id, &mut rx, timeout);
                }
                () = tokio::time::sleep(refill_wait) => {
                    self.inner.drain(resource_id);
                }
            }
        }
    }

    fn admit(&self, resource_id: &str) -> Result<Admission, RateLimitError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(RateLimitError::Disposed);
        }

        let now = self.inner.clock.now();
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut resources = self.inner.resources.lock();
        let state = resources
            .get_mut(resource_id)
            .ok_or_else(|| RateLimitError::NotConfigured {
                resource_id: resource_id.to_string(),
            })?;

        state.admit(resource_id, now, request_id, &self.inner.events)
    }

    /// Grant queued requests for one resource from available tokens
    ///
    /// Returns the number of requests granted.
    pub fn drain(&self, resource_id: &str) -> usize {
        self.inner.drain(resource_id)
    }

    /// Grant queued requests for every resource
    pub fn drain_all(&self) -> usize {
        self.inner.drain_all()
    }

    /// Snapshot of a resource's tokens, queue and quota
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::NotConfigured`] for unknown resources.
    pub fn get_status(&self, resource_id: &str) -> Result<RateLimitStatus, RateLimitError> {
        let now = self.inner.clock.now();
        self.inner
            .resources
            .lock()
            .get(resource_id)
            .map(|state| state.status(now))
            .ok_or_else(|| RateLimitError::NotConfigured {
                resource_id: resource_id.to_string(),
            })
    }

    /// Expire queued requests older than the stale threshold
    ///
    /// Returns the number of requests expired.
    pub fn sweep_stale(&self) -> usize {
        self.inner.sweep_stale()
    }

    /// Spawn the background drain and stale sweep
    ///
    /// Must be called from within a Tokio runtime. Calling it again while
    /// the tasks run has no effect.
    pub fn start_maintenance(&self) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        let mut maintenance = self.inner.maintenance.lock();
        if !maintenance.is_empty() {
            return;
        }

        let settings = &self.inner.settings;
        let weak = Arc::downgrade(&self.inner);
        maintenance.push(PeriodicTask::spawn(
            "rate-limit-drain",
            Duration::from_millis(settings.drain_interval_ms),
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.drain_all();
                }
            },
        ));

        let weak = Arc::downgrade(&self.inner);
        maintenance.push(PeriodicTask::spawn(
            "rate-limit-sweep",
            Duration::from_millis(settings.sweep_interval_ms),
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.sweep_stale();
                }
            },
        ));
    }

    /// Whether [`dispose`](Self::dispose) has been called
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Stop background work, reject every queued request and clear all state
    ///
    /// Idempotent. Later `acquire` calls fail with [`RateLimitError::Disposed`].
    pub fn dispose(&self) {
        let first = !self.inner.disposed.swap(true, Ordering::SeqCst);

        for mut task in self.inner.maintenance.lock().drain(..) {
            task.stop();
        }

        let drained: Vec<ResourceState> = self
            .inner
            .resources
            .lock()
            .drain()
            .map(|(_, state)| state)
            .collect();

        let mut rejected = 0;
        for state in drained {
            for request in state.queue {
                if request.responder.send(Err(RateLimitError::Disposed)).is_ok() {
                    rejected += 1;
                }
            }
        }

        if first {
            tracing::info!(rejected, "Rate limiter disposed");
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.inner.settings)
            .field("resources", &self.resource_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
