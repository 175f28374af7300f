//! The capability contract every channel adapter implements.
//!
//! [`Channel`] is the base contract; media, presence and reactions are
//! independent extensions an adapter exposes only when its platform supports
//! them. This is a capability set, not an inheritance hierarchy: callers ask
//! for an extension through the accessor (or consult the [`Capabilities`]
//! descriptor computed at registration) instead of downcasting.

use crate::error::ChannelError;
use crate::health::HealthSnapshot;
use crate::message::{InboundMessage, MediaMessage, MediaRef, OutboundMessage};
use async_trait::async_trait;
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;

/// Coarse presence states for platforms that track them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Available,
    Unavailable,
}

/// Base contract for a platform adapter.
///
/// All send-family operations (here and in the extensions) fail immediately
/// with [`ChannelError::Disconnected`] when the adapter is not connected;
/// they never block waiting for a reconnection to finish.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier, unique across registered adapters.
    fn name(&self) -> &str;

    /// Bring the connection up. Returns once the lifecycle machinery is
    /// running; the transition to Connected is confirmed asynchronously by
    /// the platform (watch [`Channel::health`] or the inbound stream).
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Tear the connection down. Idempotent: repeated calls and overlapping
    /// teardown must not fault.
    async fn disconnect(&self) -> Result<(), ChannelError>;

    /// Deliver one outbound message. Never auto-retries; retry policy
    /// belongs to the caller.
    async fn send(&self, recipient: &str, message: &OutboundMessage) -> Result<(), ChannelError>;

    /// The canonical inbound stream. Available exactly once; infinite until
    /// the adapter shuts down, not restartable afterwards.
    fn inbound(&self) -> Option<ReceiverStream<InboundMessage>>;

    fn is_connected(&self) -> bool;

    /// Point-in-time health, recomputed on demand.
    fn health(&self) -> HealthSnapshot;

    /// Media extension, when the platform supports it.
    fn media(&self) -> Option<&dyn MediaSupport> {
        None
    }

    /// Typing/presence/read-receipt extension.
    fn presence(&self) -> Option<&dyn PresenceSupport> {
        None
    }

    /// Reaction extension.
    fn reactions(&self) -> Option<&dyn ReactionSupport> {
        None
    }
}

/// Sending and fetching media.
#[async_trait]
pub trait MediaSupport: Send + Sync {
    async fn send_media(
        &self,
        recipient: &str,
        media: &MediaMessage,
    ) -> Result<(), ChannelError>;

    /// Fetch the bytes behind an inbound media descriptor.
    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, ChannelError>;
}

/// Typing indicators, presence updates and read receipts.
#[async_trait]
pub trait PresenceSupport: Send + Sync {
    /// Toggle the typing indicator in a chat.
    async fn send_typing(&self, chat: &str, typing: bool) -> Result<(), ChannelError>;

    /// Publish coarse availability. Also used as the cheap keepalive.
    async fn send_presence(&self, presence: Presence) -> Result<(), ChannelError>;

    /// Mark messages in a chat as read.
    async fn mark_read(&self, chat: &str, message_ids: &[String]) -> Result<(), ChannelError>;
}

/// Emoji reactions to messages.
#[async_trait]
pub trait ReactionSupport: Send + Sync {
    async fn send_reaction(
        &self,
        chat: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ChannelError>;
}

/// Which extensions an adapter implements. Computed once when the adapter is
/// registered with the manager, then queried instead of re-checking the
/// accessors at every call site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub media: bool,
    pub presence: bool,
    pub reactions: bool,
}

impl Capabilities {
    pub fn of(channel: &dyn Channel) -> Self {
        Self {
            media: channel.media().is_some(),
            presence: channel.presence().is_some(),
            reactions: channel.reactions().is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ConnectionShared;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Minimal adapter: base contract only, no extensions.
    struct BareChannel {
        shared: Arc<ConnectionShared>,
    }

    impl BareChannel {
        fn new() -> Self {
            Self {
                shared: Arc::new(ConnectionShared::new("bare", &CancellationToken::new())),
            }
        }
    }

    #[async_trait]
    impl Channel for BareChannel {
        fn name(&self) -> &str {
            "bare"
        }

        async fn connect(&self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn send(
            &self,
            _recipient: &str,
            _message: &OutboundMessage,
        ) -> Result<(), ChannelError> {
            crate::runtime::require_connected(&self.shared)
        }

        fn inbound(&self) -> Option<ReceiverStream<InboundMessage>> {
            None
        }

        fn is_connected(&self) -> bool {
            self.shared.is_connected()
        }

        fn health(&self) -> HealthSnapshot {
            HealthSnapshot::of(&self.shared, BTreeMap::new())
        }
    }

    #[test]
    fn bare_channel_exposes_no_extensions() {
        let ch = BareChannel::new();
        let caps = Capabilities::of(&ch);
        assert!(!caps.media);
        assert!(!caps.presence);
        assert!(!caps.reactions);
        assert!(ch.media().is_none());
    }

    #[tokio::test]
    async fn send_while_disconnected_is_an_immediate_error() {
        let ch = BareChannel::new();
        let err = ch
            .send("someone", &OutboundMessage::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Disconnected));
    }

    #[test]
    fn capabilities_serialize_for_the_dashboard() {
        let caps = Capabilities {
            media: true,
            presence: false,
            reactions: true,
        };
        let json = serde_json::to_value(&caps).unwrap();
        assert_eq!(json["media"], true);
        assert_eq!(json["presence"], false);
    }
}
