//! Worker health tracking and restart policy

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use toolgate_common::config::RestartConfig;
use toolgate_common::METRICS;
use tracing::{info, warn};

/// Lifecycle state of the worker as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, readiness marker not seen yet
    Starting,

    /// Readiness marker seen; requests are dispatched
    Healthy,

    /// Exited or failed to spawn; a respawn is scheduled
    Unhealthy,

    /// Shut down on request
    Terminated,

    /// Restart limit reached; no further respawns
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Healthy => "healthy",
            WorkerState::Unhealthy => "unhealthy",
            WorkerState::Terminated => "terminated",
            WorkerState::Failed => "failed",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, WorkerState::Healthy)
    }

    /// No worker will ever run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Terminated | WorkerState::Failed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay schedule between worker failures and respawns
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,

    /// Consecutive failures tolerated before giving up (None = forever)
    pub max_restarts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5),
            multiplier: 1.0,
            max_restarts: None,
        }
    }
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(config: &RestartConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
            max_restarts: config.max_restarts,
        }
    }
}

impl RestartPolicy {
    /// Fixed delay, unlimited restarts
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_backoff: delay,
            max_backoff: delay,
            multiplier: 1.0,
            max_restarts: None,
        }
    }

    /// Delay before the respawn following the `failures`-th consecutive failure
    ///
    /// Returns None once the restart limit is exceeded.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if self.max_restarts.is_some_and(|max| failures > max) {
            return None;
        }

        let exponent = failures.saturating_sub(1).min(32) as i32;
        if exponent == 0 || self.multiplier <= 1.0 {
            return Some(self.initial_backoff.min(self.max_backoff));
        }

        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_backoff.as_secs_f64() {
            return Some(self.max_backoff);
        }

        Some(Duration::from_secs_f64(scaled))
    }
}

/// Watches worker output for readiness and decides on restarts
#[derive(Debug)]
pub struct HealthMonitor {
    readiness_marker: String,
    policy: RestartPolicy,
    state: watch::Sender<WorkerState>,
    consecutive_failures: u32,
}

impl HealthMonitor {
    pub fn new(
        readiness_marker: impl Into<String>,
        policy: RestartPolicy,
    ) -> (Self, watch::Receiver<WorkerState>) {
        let (state, rx) = watch::channel(WorkerState::Starting);
        let monitor = Self {
            readiness_marker: readiness_marker.into(),
            policy,
            state,
            consecutive_failures: 0,
        };
        (monitor, rx)
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// A new worker process was started
    pub fn on_spawned(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        self.set_state(WorkerState::Starting);
    }

    /// Inspect one line of worker output
    ///
    /// Returns true if this line made the worker healthy.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.state() != WorkerState::Starting || !line.contains(&self.readiness_marker) {
            return false;
        }

        info!("Worker reported ready");
        self.consecutive_failures = 0;
        self.set_state(WorkerState::Healthy);
        true
    }

    /// The worker exited or could not be spawned
    ///
    /// Returns the delay before the next spawn, or None if no respawn should
    /// happen.
    pub fn on_failure(&mut self) -> Option<Duration> {
        if self.state().is_terminal() {
            return None;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        match self.policy.delay_for(self.consecutive_failures) {
            Some(delay) => {
                self.set_state(WorkerState::Unhealthy);
                METRICS.worker.restart_backoff_seconds.set(delay.as_secs_f64());
                Some(delay)
            }
            None => {
                warn!(
                    "Worker failed {} times in a row, giving up",
                    self.consecutive_failures
                );
                self.set_state(WorkerState::Failed);
                None
            }
        }
    }

    /// Shut down for good
    pub fn terminate(&mut self) {
        if self.state() != WorkerState::Failed {
            self.set_state(WorkerState::Terminated);
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Worker state: {} -> {}", previous, state);
        }
        METRICS.worker.healthy.set(state.is_healthy() as i64);
    }
}
