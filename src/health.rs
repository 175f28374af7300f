//! Health snapshots and the per-adapter watchdog.
//!
//! The watchdog detects silent and half-open connections by idle duration.
//! Two independent thresholds: past the soft threshold the transport is
//! cross-checked and reconnection triggered only on disagreement; past the
//! hard threshold reconnection is forced no matter what the transport claims,
//! because a half-open socket will happily keep claiming it is connected.

use crate::config::HealthConfig;
use crate::runtime::ConnectionShared;
use crate::state::ConnectionState;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Point-in-time health of one adapter. Recomputed on demand, not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub connected: bool,
    pub state: ConnectionState,
    pub last_activity: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub reconnect_attempts: u32,
    /// Platform-specific extras (queue drop counts, poll offsets, …).
    pub detail: BTreeMap<String, String>,
}

impl HealthSnapshot {
    pub fn of(shared: &ConnectionShared, detail: BTreeMap<String, String>) -> Self {
        let last_activity = shared
            .last_activity_ms()
            .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single());
        Self {
            connected: shared.is_connected(),
            state: shared.state.current(),
            last_activity,
            consecutive_errors: shared.consecutive_errors(),
            reconnect_attempts: shared.attempts(),
            detail,
        }
    }
}

/// Low-level connectivity cross-check, implemented per adapter.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Whether the underlying transport believes it is connected. Cheap; no
    /// round-trip heavier than a socket/state inspection.
    async fn transport_alive(&self) -> bool;
}

/// Why the watchdog requested a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Soft threshold passed and the transport disagreed with the believed
    /// connection state.
    SoftCheckFailed,
    /// Hard threshold passed; reconnect unconditionally.
    HardIdle,
}

/// What a given idle duration calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleAction {
    None,
    CrossCheck,
    ForceReconnect,
}

pub(crate) fn classify_idle(idle: Duration, soft: Duration, hard: Duration) -> IdleAction {
    if idle >= hard {
        IdleAction::ForceReconnect
    } else if idle >= soft {
        IdleAction::CrossCheck
    } else {
        IdleAction::None
    }
}

/// Spawn the periodic health watchdog for one adapter.
///
/// `trigger` is the adapter's reconnect entry point; it must be safe to call
/// from concurrent tasks (the single-flight guard inside the adapter takes
/// care of collapsing duplicates).
pub fn spawn_watchdog(
    shared: Arc<ConnectionShared>,
    cfg: HealthConfig,
    probe: Arc<dyn ConnectivityProbe>,
    trigger: Arc<dyn Fn(StaleReason) + Send + Sync>,
) -> JoinHandle<()> {
    let cancel = shared.cancel_token().clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if shared.state.current() != ConnectionState::Connected {
                continue;
            }
            let Some(idle) = shared.idle() else {
                continue;
            };
            match classify_idle(idle, cfg.soft_idle(), cfg.hard_idle()) {
                IdleAction::ForceReconnect => {
                    tracing::warn!(
                        "{}: no activity for {}s (hard threshold), forcing reconnect",
                        shared.name(),
                        idle.as_secs()
                    );
                    trigger(StaleReason::HardIdle);
                }
                IdleAction::CrossCheck => {
                    if !probe.transport_alive().await {
                        tracing::warn!(
                            "{}: idle {}s and transport reports dead, reconnecting",
                            shared.name(),
                            idle.as_secs()
                        );
                        trigger(StaleReason::SoftCheckFailed);
                    }
                }
                IdleAction::None => {}
            }
        }
    })
}

/// Spawn the low-frequency keepalive ticker.
///
/// Emits a cheap presence update while connected, refreshing the activity
/// timestamp and keeping NAT/firewall state warm. Failures are logged and
/// counted; the reconnect decision stays with the watchdog.
pub fn spawn_keepalive<F, Fut>(
    shared: Arc<ConnectionShared>,
    interval: Duration,
    keepalive: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), crate::error::ChannelError>> + Send,
{
    let cancel = shared.cancel_token().clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a freshly connected
        // adapter doesn't double-send presence.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !shared.is_connected() {
                continue;
            }
            match keepalive().await {
                Ok(()) => shared.touch(),
                Err(e) => {
                    shared.record_error();
                    tracing::debug!("{}: keepalive failed: {e}", shared.name());
                }
            }
        }
    })
}
