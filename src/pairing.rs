//! Pairing/device-linking event fan-out.
//!
//! Platforms that authenticate with a scanned one-time code emit a stream of
//! pairing tokens while linking. The broadcaster fans those out to every
//! current subscriber without ever awaiting a slow one, and replays the most
//! recent `Code` event to late subscribers so a dashboard that connects a few
//! seconds after the code was generated still gets something to render.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// One event in the pairing flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// A scannable pairing token. `expires_in` is the remaining validity at
    /// the moment the subscriber receives the event.
    Code {
        payload: String,
        message: String,
        expires_in: Duration,
    },
    /// The device was linked. Terminal; clears the cached code.
    Success { message: String },
    /// The pairing window elapsed without a scan. Terminal.
    Timeout { message: String },
    /// The platform rejected the pairing attempt. Terminal.
    Error { message: String },
    /// An explicit refresh restarted the flow; a new code follows.
    Refresh { message: String },
}

impl PairingEvent {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            PairingEvent::Success { .. }
                | PairingEvent::Timeout { .. }
                | PairingEvent::Error { .. }
        )
    }
}

#[derive(Debug)]
struct CachedCode {
    payload: String,
    message: String,
    ttl: Duration,
    issued_at: Instant,
}

/// Fan-out point for pairing events.
///
/// Built on `tokio::sync::broadcast`: publishing never blocks, and a
/// subscriber that falls behind is skipped (it observes a lag error), never
/// awaited. Dropping the receiver unsubscribes; no manual list surgery.
#[derive(Debug)]
pub struct PairingBroadcaster {
    tx: broadcast::Sender<PairingEvent>,
    last_code: Mutex<Option<CachedCode>>,
}

impl PairingBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            last_code: Mutex::new(None),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// `Code` events replace the cached code; terminal events clear it. The
    /// send is non-blocking and having zero subscribers is not an error.
    pub fn publish(&self, event: PairingEvent) {
        match &event {
            PairingEvent::Code {
                payload,
                message,
                expires_in,
            } => {
                *self.last_code.lock() = Some(CachedCode {
                    payload: payload.clone(),
                    message: message.clone(),
                    ttl: *expires_in,
                    issued_at: Instant::now(),
                });
            }
            ev if ev.is_terminal() => {
                self.last_code.lock().take();
            }
            _ => {}
        }
        let _ = self.tx.send(event);
    }

    /// Subscribe to pairing events.
    ///
    /// Returns the replayed most-recent `Code` event, if one is still live,
    /// with its remaining validity recomputed from elapsed time (never
    /// negative), plus the live receiver for subsequent events.
    pub fn subscribe(&self) -> (Option<PairingEvent>, broadcast::Receiver<PairingEvent>) {
        let rx = self.tx.subscribe();
        let replay = self.last_code.lock().as_ref().map(|cached| {
            let remaining = cached.ttl.saturating_sub(cached.issued_at.elapsed());
            PairingEvent::Code {
                payload: cached.payload.clone(),
                message: cached.message.clone(),
                expires_in: remaining,
            }
        });
        (replay, rx)
    }

    /// Drop the cached code without publishing anything. Used when a pairing
    /// attempt is discarded by an explicit refresh.
    pub fn clear(&self) {
        self.last_code.lock().take();
    }

    /// Number of live subscribers, for health detail maps.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for PairingBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
