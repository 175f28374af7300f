//! Seam between the WhatsApp adapter and the external multi-device session
//! protocol client.
//!
//! The wire protocol (persistent socket, Signal-encrypted session storage,
//! pairing handshake) lives in an external client library; the adapter only
//! consumes it through this trait. Everything the adapter's lifecycle machine
//! reacts to arrives as a [`SessionEvent`] on the transport's event stream.

use crate::message::{MediaMessage, MediaRef};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Failures inside the session protocol client.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("session transport is not connected")]
    NotConnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("i/o failure: {0}")]
    Io(String),
}

/// Kinds of media a wire message can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
    Sticker,
}

/// Content of one wire-level message, already decrypted by the client.
#[derive(Debug, Clone)]
pub enum WireContent {
    Text {
        body: String,
    },
    Media {
        kind: MediaKind,
        caption: String,
        media: MediaRef,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
    },
    Contact {
        display_name: String,
        vcard: Option<String>,
    },
    Reaction {
        target_id: String,
        emoji: String,
    },
}

/// One decrypted message as the session client delivers it.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub id: String,
    /// Chat JID (DM or group).
    pub chat: String,
    /// Sender JID.
    pub sender: String,
    pub push_name: Option<String>,
    pub is_group: bool,
    pub is_from_me: bool,
    pub timestamp_ms: i64,
    pub content: WireContent,
    /// (quoted message id, quoted text) when this message replies to one.
    pub quoted: Option<(String, String)>,
}

/// Events the session client emits. The adapter's event dispatcher is the
/// only consumer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The platform confirmed the connection is live. This, not the return
    /// of a connect call, is what moves the adapter to Connected.
    Connected,
    /// The transport dropped; retryable.
    Disconnected { reason: String },
    /// Another client took over this session's stream; retryable.
    StreamReplaced,
    /// Stream-level protocol error. Fatal errors are non-retryable.
    StreamError { message: String, fatal: bool },
    /// A pairing token to show the user.
    PairingCode {
        payload: String,
        expires_in: Duration,
    },
    /// The phone scanned the code.
    PairingSuccess,
    /// The pairing window elapsed without a scan.
    PairingTimeout,
    /// The account was unlinked from the phone side.
    LoggedOut,
    /// Temporary suspension by the platform; no automatic retry.
    TemporaryBan { message: String },
    Message(Box<WireMessage>),
}

/// The narrow interface to the external session protocol client.
///
/// Implementations are expected to be cheap to call and to surface all
/// asynchronous outcomes (connected confirmations, losses, pairing progress)
/// through the event stream rather than through return values.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Whether persisted credentials from a previous pairing exist.
    fn has_session(&self) -> bool;

    /// Own JID once the session is established; used for self-message
    /// suppression.
    fn self_id(&self) -> Option<String>;

    /// Hand out the event stream exactly once.
    fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>>;

    /// Open the socket and start the session (resume or fresh pairing).
    /// Success here only means the attempt was started; wait for
    /// [`SessionEvent::Connected`].
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the socket and drop in-memory connection state. Must be safe to
    /// call on an already-closed transport; the reconnect path calls this
    /// before every retry to clear half-closed sessions.
    async fn disconnect(&self);

    /// Unlink the device: close the socket and delete persisted credentials.
    async fn logout(&self) -> Result<(), TransportError>;

    /// Discard any half-open pairing attempt and request a fresh code
    /// stream, bounded by `timeout`.
    async fn restart_pairing(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Low-level connectivity cross-check: does the socket itself believe it
    /// is open? Cheap; no network round-trip.
    async fn alive(&self) -> bool;

    /// Send a text message; returns the platform message id.
    async fn send_text(
        &self,
        chat: &str,
        body: &str,
        quote: Option<&str>,
    ) -> Result<String, TransportError>;

    /// Upload and send media; returns the platform message id.
    async fn send_media(&self, chat: &str, media: &MediaMessage)
        -> Result<String, TransportError>;

    /// Fetch and decrypt media referenced by an inbound message.
    async fn download(&self, media: &MediaRef) -> Result<Vec<u8>, TransportError>;

    /// Composing/paused chat state.
    async fn send_chat_state(&self, chat: &str, typing: bool) -> Result<(), TransportError>;

    /// Global available/unavailable presence. Cheap enough for keepalive.
    async fn send_presence(&self, available: bool) -> Result<(), TransportError>;

    /// Mark the given messages read in a chat.
    async fn mark_read(&self, chat: &str, message_ids: &[String]) -> Result<(), TransportError>;

    /// React to a message; returns the platform message id of the reaction.
    async fn send_reaction(
        &self,
        chat: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<String, TransportError>;
}
