//! Short-lived registry for interactive components (buttons, menus).
//!
//! Platforms with clickable components deliver an opaque interaction id when
//! the user clicks. The registry maps that id to a handler for a bounded
//! time; a background sweep removes entries past their TTL so abandoned
//! prompts don't accumulate handlers forever.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What the platform tells us about a component click.
#[derive(Debug, Clone)]
pub struct InteractionEvent {
    /// The component's custom id (the registry key).
    pub component_id: String,
    /// Platform id of the interaction instance, for acknowledgement calls.
    pub interaction_id: String,
    /// One-time token for responding, where the platform uses one.
    pub token: Option<String>,
    pub user: String,
    pub chat: String,
}

/// Async callback invoked when a registered component is clicked.
pub type InteractionHandler =
    Arc<dyn Fn(InteractionEvent) -> BoxFuture<'static, ()> + Send + Sync>;

struct Entry {
    handler: InteractionHandler,
    /// When set, only these user ids may trigger the handler.
    allowed_users: Option<Vec<String>>,
    registered_at: Instant,
}

/// Outcome of dispatching a click.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// Unknown id: never registered, already swept, or already consumed.
    NotFound,
    /// The clicking user is not on the entry's allowlist.
    Denied,
}

/// TTL'd map from component id to handler.
pub struct InteractionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl InteractionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Register a handler. Re-registering an id replaces the previous entry
    /// and restarts its TTL.
    pub fn register(
        &self,
        component_id: impl Into<String>,
        allowed_users: Option<Vec<String>>,
        handler: InteractionHandler,
    ) {
        self.entries.lock().insert(
            component_id.into(),
            Entry {
                handler,
                allowed_users,
                registered_at: Instant::now(),
            },
        );
    }

    pub fn unregister(&self, component_id: &str) {
        self.entries.lock().remove(component_id);
    }

    /// Look up and run the handler for a click. Expired entries count as
    /// not found (the sweeper may simply not have gotten to them yet).
    pub async fn dispatch(&self, event: InteractionEvent) -> Dispatch {
        let handler = {
            let entries = self.entries.lock();
            let Some(entry) = entries.get(&event.component_id) else {
                return Dispatch::NotFound;
            };
            if entry.registered_at.elapsed() > self.ttl {
                return Dispatch::NotFound;
            }
            if let Some(allowed) = &entry.allowed_users {
                if !allowed.iter().any(|u| u == &event.user) {
                    return Dispatch::Denied;
                }
            }
            Arc::clone(&entry.handler)
        };
        handler(event).await;
        Dispatch::Handled
    }

    /// Remove entries past their TTL. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.registered_at.elapsed() <= ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawn the periodic TTL sweep for a registry.
pub fn spawn_sweeper(
    registry: Arc<InteractionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let removed = registry.sweep();
            if removed > 0 {
                tracing::debug!("interaction registry: swept {removed} expired entries");
            }
        }
    })
}
