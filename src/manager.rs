//! Registry and dispatch point for channel adapters.
//!
//! The manager is the only caller of adapter lifecycle methods besides
//! process startup/shutdown. Adapters are registered once at startup and
//! live for the process lifetime; the manager aggregates their health and
//! routes outbound calls by channel name.

use crate::error::ChannelError;
use crate::health::HealthSnapshot;
use crate::message::{MediaMessage, OutboundMessage};
use crate::traits::{Capabilities, Channel};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

struct Registered {
    channel: Arc<dyn Channel>,
    /// Capability descriptor computed once at registration.
    caps: Capabilities,
}

/// Holds every adapter, keyed by [`Channel::name`].
#[derive(Default)]
pub struct ChannelManager {
    channels: RwLock<BTreeMap<String, Registered>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. A same-named adapter is replaced.
    pub fn register(&self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        let caps = Capabilities::of(channel.as_ref());
        info!(
            "registering channel {name} (media={}, presence={}, reactions={})",
            caps.media, caps.presence, caps.reactions
        );
        self.channels
            .write()
            .insert(name, Registered { channel, caps });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels
            .read()
            .get(name)
            .map(|r| Arc::clone(&r.channel))
    }

    /// The capability descriptor recorded at registration.
    pub fn capabilities(&self, name: &str) -> Option<Capabilities> {
        self.channels.read().get(name).map(|r| r.caps)
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    /// Connect every registered adapter. Failures are logged and do not stop
    /// the rest from connecting; each adapter's own reconnect machinery takes
    /// over from there.
    pub async fn connect_all(&self) {
        for (name, channel) in self.snapshot_channels() {
            info!("connecting channel {name}");
            if let Err(e) = channel.connect().await {
                warn!("channel {name} failed to connect: {e}");
            }
        }
    }

    /// Disconnect every adapter. Errors are logged; disconnect is idempotent
    /// so a second shutdown pass is harmless.
    pub async fn shutdown_all(&self) {
        for (name, channel) in self.snapshot_channels() {
            if let Err(e) = channel.disconnect().await {
                warn!("channel {name} failed to disconnect cleanly: {e}");
            }
        }
    }

    /// Health of every adapter, keyed by name.
    pub fn health_all(&self) -> BTreeMap<String, HealthSnapshot> {
        self.channels
            .read()
            .iter()
            .map(|(name, r)| (name.clone(), r.channel.health()))
            .collect()
    }

    /// Send a text message through the named channel.
    pub async fn send(
        &self,
        channel: &str,
        recipient: &str,
        message: &OutboundMessage,
    ) -> Result<(), ChannelError> {
        let ch = self
            .get(channel)
            .ok_or_else(|| ChannelError::NotRegistered(channel.to_string()))?;
        ch.send(recipient, message).await
    }

    /// Send media through the named channel, if it has the media capability.
    pub async fn send_media(
        &self,
        channel: &str,
        recipient: &str,
        media: &MediaMessage,
    ) -> Result<(), ChannelError> {
        let ch = self
            .get(channel)
            .ok_or_else(|| ChannelError::NotRegistered(channel.to_string()))?;
        match ch.media() {
            Some(ext) => ext.send_media(recipient, media).await,
            None => Err(ChannelError::NotSupported("media")),
        }
    }

    fn snapshot_channels(&self) -> Vec<(String, Arc<dyn Channel>)> {
        self.channels
            .read()
            .iter()
            .map(|(name, r)| (name.clone(), Arc::clone(&r.channel)))
            .collect()
    }
}
