//! Reconnection backoff and the single-flight guard.
//!
//! A connection loss can be reported by several tasks at once: the receive
//! loop, the health watchdog, a stream-replacement event. The guard makes
//! sure only one reconnection sequence runs per adapter no matter how many
//! triggers fire; the policy computes a linearly growing, capped backoff.

use crate::config::ReconnectConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Backoff schedule for one adapter's reconnection sequences.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// 0 = retry forever (explicit operator opt-in, see [`ReconnectConfig`]).
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(cfg: &ReconnectConfig) -> Self {
        Self {
            base: Duration::from_secs(cfg.base_secs),
            cap: Duration::from_secs(cfg.cap_secs),
            max_attempts: cfg.max_attempts,
        }
    }

    /// Delay before attempt `attempt` (1-based): `min(base × attempt, cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let scaled = self
            .base
            .checked_mul(attempt.max(1))
            .unwrap_or(self.cap);
        scaled.min(self.cap)
    }

    /// Whether `attempt` exceeds the configured budget.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt > self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

/// Advance the shared attempt counter for one more backoff cycle.
///
/// Returns the attempt number and its delay, or `None` when the budget is
/// spent. On `None` the counter is left untouched, so health snapshots
/// report exactly how many attempts were made.
pub fn next_backoff(
    shared: &crate::runtime::ConnectionShared,
    policy: &ReconnectPolicy,
) -> Option<(u32, Duration)> {
    let upcoming = shared.attempts().saturating_add(1);
    if policy.exhausted(upcoming) {
        return None;
    }
    let attempt = shared.next_attempt();
    Some((attempt, policy.backoff(attempt)))
}

/// Ensures at most one reconnection sequence per adapter.
///
/// `try_begin` hands out a guard only when no other sequence is in flight;
/// the guard releases the slot on drop, so early returns and panics inside
/// the sequence cannot wedge the adapter.
#[derive(Debug, Default)]
pub struct SingleFlight {
    active: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> Option<FlightGuard> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(FlightGuard {
                active: Arc::clone(&self.active),
            })
        } else {
            None
        }
    }

    pub fn in_flight(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// RAII slot for one reconnection sequence.
#[derive(Debug)]
pub struct FlightGuard {
    active: Arc<AtomicBool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}
