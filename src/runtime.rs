//! Shared per-adapter runtime state.
//!
//! Every adapter runs several long-lived tasks (receive loop, health ticker,
//! keepalive ticker, on-demand reconnection) that all read and write the same
//! small set of variables. `ConnectionShared` keeps those behind atomics and
//! the validated state cell, with a cancellation token that stops every task
//! cooperatively.

use crate::state::{ConnectionState, StateCell};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// State shared between an adapter's concurrent tasks.
#[derive(Debug)]
pub struct ConnectionShared {
    name: &'static str,
    pub state: StateCell,
    /// Reconnect attempts in the current sequence. Reset on confirmed connect.
    attempts: AtomicU32,
    /// Consecutive transport errors since the last successful operation.
    consecutive_errors: AtomicU32,
    /// Malformed inbound payloads dropped so far. Monotonic.
    malformed: AtomicU64,
    /// Unix millis of the last observed platform activity. 0 = never.
    last_activity_ms: AtomicU64,
    cancel: CancellationToken,
}

impl ConnectionShared {
    pub fn new(name: &'static str, parent: &CancellationToken) -> Self {
        Self {
            name,
            state: StateCell::new(),
            attempts: AtomicU32::new(0),
            consecutive_errors: AtomicU32::new(0),
            malformed: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            cancel: parent.child_token(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Token guarding all of this adapter's background tasks.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_connected(&self) -> bool {
        self.state.current().is_connected()
    }

    /// Record platform activity now.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(now_unix_millis(), Ordering::Relaxed);
    }

    /// Unix millis of last activity, if any was ever observed.
    pub fn last_activity_ms(&self) -> Option<u64> {
        match self.last_activity_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Time since last observed activity. `None` before any activity.
    pub fn idle(&self) -> Option<Duration> {
        let last = self.last_activity_ms()?;
        Some(Duration::from_millis(now_unix_millis().saturating_sub(last)))
    }

    /// Increment the consecutive-error counter and return the new value.
    pub fn record_error(&self) -> u32 {
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn clear_errors(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    /// Count a malformed inbound payload that was dropped. Unlike
    /// [`record_error`](Self::record_error) this never feeds the reconnect
    /// path; a garbage message is not a transport problem.
    pub fn record_malformed(&self) -> u64 {
        self.malformed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Shift the recorded last activity into the past. Test hook for the
    /// watchdog's idle classification.
    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, by: Duration) {
        let ms = now_unix_millis().saturating_sub(by.as_millis() as u64);
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    /// Increment the reconnect attempt counter and return the new value.
    pub fn next_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Called when the platform confirms a live connection.
    pub fn mark_connected(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        self.clear_errors();
        self.touch();
    }
}

fn now_unix_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Convenience: whether the shared state currently allows sends.
pub fn require_connected(shared: &ConnectionShared) -> Result<(), crate::error::ChannelError> {
    if shared.is_connected() {
        Ok(())
    } else {
        Err(crate::error::ChannelError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> ConnectionShared {
        ConnectionShared::new("test", &CancellationToken::new())
    }

    #[test]
    fn starts_with_no_activity() {
        let s = shared();
        assert!(s.last_activity_ms().is_none());
        assert!(s.idle().is_none());
    }

    #[test]
    fn touch_records_activity() {
        let s = shared();
        s.touch();
        assert!(s.last_activity_ms().is_some());
        assert!(s.idle().unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn error_counter_increments_and_clears() {
        let s = shared();
        assert_eq!(s.record_error(), 1);
        assert_eq!(s.record_error(), 2);
        s.clear_errors();
        assert_eq!(s.consecutive_errors(), 0);
    }

    #[test]
    fn malformed_counter_is_monotonic() {
        let s = shared();
        s.record_malformed();
        s.record_malformed();
        s.clear_errors();
        // Unlike the error counter, malformed drops are never reset.
        assert_eq!(s.malformed(), 2);
    }

    #[test]
    fn mark_connected_resets_counters() {
        let s = shared();
        s.next_attempt();
        s.next_attempt();
        s.record_error();
        s.mark_connected();
        assert_eq!(s.attempts(), 0);
        assert_eq!(s.consecutive_errors(), 0);
        assert!(s.last_activity_ms().is_some());
    }

    #[test]
    fn require_connected_rejects_when_disconnected() {
        let s = shared();
        assert!(require_connected(&s).is_err());
        s.state
            .transition(ConnectionState::Connecting)
            .unwrap();
        s.state.transition(ConnectionState::Connected).unwrap();
        assert!(require_connected(&s).is_ok());
    }

    #[test]
    fn child_token_follows_parent_cancellation() {
        let parent = CancellationToken::new();
        let s = ConnectionShared::new("test", &parent);
        assert!(!s.cancel_token().is_cancelled());
        parent.cancel();
        assert!(s.cancel_token().is_cancelled());
    }
}
