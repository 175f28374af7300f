//! Connection lifecycle state machine.
//!
//! Each adapter owns exactly one [`StateCell`]. The cell validates every
//! transition against an explicit table and rejects illegal ones instead of
//! silently overwriting state; the health monitor and public status queries
//! only ever read.

use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle states of one platform connection.
///
/// WhatsApp exercises the full machine; Discord/Telegram/Slack use the
/// subset without pairing and ban states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    WaitingPairing,
    PairingConfirmed,
    LoggingOut,
    Banned,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal lifecycle transition.
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, WaitingPairing)
                | (Connecting, Disconnected)
                | (WaitingPairing, PairingConfirmed)
                | (WaitingPairing, Disconnected)
                | (PairingConfirmed, Connected)
                | (PairingConfirmed, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Connected, Banned)
                | (Connected, LoggingOut)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
                | (Reconnecting, Banned)
                | (Reconnecting, LoggingOut)
                | (Banned, LoggingOut)
                | (Banned, Disconnected)
                | (LoggingOut, Disconnected)
        )
    }

    /// States in which the adapter may move traffic.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Terminal states that automatic recovery never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Banned)
    }
}

/// Shared, watchable holder for an adapter's [`ConnectionState`].
///
/// Built on a tokio `watch` channel so lifecycle tasks can await a state
/// change (e.g. the reconnect loop waiting for the platform's Connected
/// confirmation) without polling.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Attempt a transition, returning the previous state on success.
    pub fn transition(&self, to: ConnectionState) -> Result<ConnectionState, ChannelError> {
        let mut result = Err(ChannelError::IllegalTransition {
            from: self.current(),
            to,
        });
        self.tx.send_if_modified(|state| {
            if state.can_transition(to) {
                result = Ok(*state);
                *state = to;
                true
            } else {
                result = Err(ChannelError::IllegalTransition { from: *state, to });
                false
            }
        });
        result
    }

    /// Transition if legal; otherwise leave the state alone and report false.
    /// For event handlers where a stale event racing a newer transition is
    /// expected and not worth an error path.
    pub fn transition_if_legal(&self, to: ConnectionState) -> bool {
        self.transition(to).is_ok()
    }

    /// Subscribe to state changes. The receiver sees the current value first.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
