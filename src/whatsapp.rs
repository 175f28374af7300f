//! WhatsApp channel over the external multi-device session client.
//!
//! The richest adapter: full lifecycle machine including pairing and ban
//! states, the pairing-code broadcaster, health watchdog plus keepalive, and
//! single-flight reconnection. The wire protocol itself lives behind
//! [`SessionTransport`]; this module owns everything around it.

use crate::config::WhatsAppConfig;
use crate::error::ChannelError;
use crate::health::{
    spawn_keepalive, spawn_watchdog, ConnectivityProbe, HealthSnapshot, StaleReason,
};
use crate::message::{
    ContactCard, ContentType, InboundMessage, Location, MediaMessage, MediaRef, OutboundMessage,
    Reaction,
};
use crate::pairing::{PairingBroadcaster, PairingEvent};
use crate::policy::{strip_reasoning, InboundPolicy};
use crate::queue::DeliveryQueue;
use crate::reconnect::{ReconnectPolicy, SingleFlight};
use crate::runtime::ConnectionShared;
use crate::sent_cache::SentMessageCache;
use crate::state::ConnectionState;
use crate::traits::{Channel, MediaSupport, Presence, PresenceSupport, ReactionSupport};
use crate::whatsapp_transport::{
    MediaKind, SessionEvent, SessionTransport, WireContent, WireMessage,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// How long a reconnect attempt waits for the platform's Connected
/// confirmation before counting the attempt as failed.
const CONNECT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(20);

struct Inner {
    cfg: WhatsAppConfig,
    transport: Arc<dyn SessionTransport>,
    shared: Arc<ConnectionShared>,
    policy: InboundPolicy,
    queue: DeliveryQueue,
    pairing: PairingBroadcaster,
    sent: SentMessageCache,
    reconnect_policy: ReconnectPolicy,
    flight: SingleFlight,
}

/// WhatsApp adapter. Construct once at startup, [`connect`](Channel::connect)
/// through the channel manager, and keep for the process lifetime.
pub struct WhatsAppChannel {
    inner: Arc<Inner>,
}

impl WhatsAppChannel {
    pub fn new(
        cfg: WhatsAppConfig,
        transport: Arc<dyn SessionTransport>,
        parent: &CancellationToken,
    ) -> Self {
        let policy = InboundPolicy {
            allowed_senders: cfg.allowed_numbers.clone(),
            blocked_senders: cfg.blocked_numbers.clone(),
            allowed_chats: cfg.allowed_chats.clone(),
            group_policy: cfg.group_policy,
        };
        let inner = Inner {
            shared: Arc::new(ConnectionShared::new("whatsapp", parent)),
            policy,
            queue: DeliveryQueue::new("whatsapp", cfg.queue_capacity),
            pairing: PairingBroadcaster::new(),
            sent: SentMessageCache::default(),
            reconnect_policy: ReconnectPolicy::from_config(&cfg.reconnect),
            flight: SingleFlight::new(),
            transport,
            cfg,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Subscribe to pairing events. Late subscribers immediately receive the
    /// cached most-recent code, if one is still live.
    pub fn subscribe_pairing(
        &self,
    ) -> (
        Option<PairingEvent>,
        tokio::sync::broadcast::Receiver<PairingEvent>,
    ) {
        self.inner.pairing.subscribe()
    }

    /// Discard any half-open pairing attempt and restart the flow.
    ///
    /// Valid only while disconnected; a bounded timeout applies (the
    /// configured default when the caller supplies none).
    pub async fn refresh_pairing(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        if self.inner.shared.is_connected() {
            return Err(ChannelError::Pairing(
                "pairing refresh is only valid while disconnected".into(),
            ));
        }
        let timeout =
            timeout.unwrap_or(Duration::from_secs(self.inner.cfg.pairing.refresh_timeout_secs));
        self.inner.pairing.clear();
        self.inner.pairing.publish(PairingEvent::Refresh {
            message: "restarting pairing, a new code will follow".into(),
        });
        // Re-enter the pairing arm of the state machine if we fell back to
        // Disconnected.
        if self.inner.shared.state.current() == ConnectionState::Disconnected {
            self.inner
                .shared
                .state
                .transition(ConnectionState::Connecting)?;
        }
        self.inner
            .shared
            .state
            .transition_if_legal(ConnectionState::WaitingPairing);
        self.inner
            .transport
            .restart_pairing(timeout)
            .await
            .map_err(|e| ChannelError::Pairing(e.to_string()))
    }

    /// Unlink this device: tears the connection down and clears the persisted
    /// session, so the next connect starts a fresh pairing.
    pub async fn logout(&self) -> Result<(), ChannelError> {
        let state = &self.inner.shared.state;
        if state.current() == ConnectionState::Disconnected {
            return Ok(());
        }
        state.transition_if_legal(ConnectionState::LoggingOut);
        let result = self
            .inner
            .transport
            .logout()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()));
        self.inner.pairing.clear();
        self.inner.queue.close();
        self.inner.shared.cancel_token().cancel();
        state.transition_if_legal(ConnectionState::Disconnected);
        result
    }

    /// `"1234@s.whatsapp.net"` or `"+1234"` → `"+1234"`.
    fn normalize_phone(raw: &str) -> String {
        let trimmed = raw.trim();
        let user_part = trimmed
            .split_once('@')
            .map(|(user, _)| user)
            .unwrap_or(trimmed);
        format!("+{}", user_part.trim_start_matches('+'))
    }

    /// Whether the recipient string is already a JID.
    fn is_jid(recipient: &str) -> bool {
        recipient.trim().contains('@')
    }

    /// Convert a recipient (full JID or phone number) to a chat JID.
    fn recipient_to_jid(recipient: &str) -> Result<String, ChannelError> {
        let trimmed = recipient.trim();
        if trimmed.is_empty() {
            return Err(ChannelError::InvalidRecipient(recipient.to_string()));
        }
        if trimmed.contains('@') {
            return Ok(trimmed.to_string());
        }
        let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(ChannelError::InvalidRecipient(recipient.to_string()));
        }
        Ok(format!("{digits}@s.whatsapp.net"))
    }

    fn number_allowed(&self, recipient: &str) -> bool {
        // Only phone-number targets go through the allowlist; explicit JIDs
        // (groups in particular) are the operator's own addressing.
        if Self::is_jid(recipient) {
            return true;
        }
        let normalized = Self::normalize_phone(recipient);
        self.inner.policy.sender_allowed([normalized.as_str()])
    }
}

/// Map one wire message into the canonical model, applying reaction scoping
/// and the inbound policy. Returns `None` when the message is dropped.
fn normalize_wire(
    wire: &WireMessage,
    sent: &SentMessageCache,
    policy: &InboundPolicy,
    self_id: Option<&str>,
) -> Option<InboundMessage> {
    if wire.is_from_me {
        tracing::debug!("whatsapp: suppressing own message {}", wire.id);
        return None;
    }

    let sender = WhatsAppChannel::normalize_phone(&wire.sender);
    let timestamp = Utc
        .timestamp_millis_opt(wire.timestamp_ms)
        .single()
        .unwrap_or_else(Utc::now);

    let mut msg = InboundMessage {
        id: wire.id.clone(),
        channel: "whatsapp".into(),
        sender,
        sender_name: wire.push_name.clone(),
        chat: wire.chat.clone(),
        is_group: wire.is_group,
        content_type: ContentType::Text,
        content: String::new(),
        timestamp,
        reply_to: None,
        quoted_text: None,
        media: None,
        location: None,
        contact: None,
        reaction: None,
        metadata: BTreeMap::new(),
    };
    if let Some((quoted_id, quoted_text)) = &wire.quoted {
        msg.reply_to = Some(quoted_id.clone());
        msg.quoted_text = Some(quoted_text.clone());
    }
    msg.metadata
        .insert("jid".into(), serde_json::Value::String(wire.sender.clone()));

    match &wire.content {
        WireContent::Text { body } => {
            let body = body.trim();
            if body.is_empty() {
                tracing::debug!("whatsapp: ignoring empty message from {}", msg.sender);
                return None;
            }
            msg.content = body.to_string();
        }
        WireContent::Media {
            kind,
            caption,
            media,
        } => {
            msg.content_type = match kind {
                MediaKind::Image => ContentType::Image,
                MediaKind::Audio => ContentType::Audio,
                MediaKind::Video => ContentType::Video,
                MediaKind::Document => ContentType::Document,
                MediaKind::Sticker => ContentType::Sticker,
            };
            msg.content = caption.clone();
            msg.media = Some(media.clone());
        }
        WireContent::Location {
            latitude,
            longitude,
            name,
        } => {
            msg.content_type = ContentType::Location;
            msg.location = Some(Location {
                latitude: *latitude,
                longitude: *longitude,
                name: name.clone(),
            });
        }
        WireContent::Contact {
            display_name,
            vcard,
        } => {
            msg.content_type = ContentType::Contact;
            msg.content = display_name.clone();
            msg.contact = Some(ContactCard {
                display_name: display_name.clone(),
                vcard: vcard.clone(),
            });
        }
        WireContent::Reaction { target_id, emoji } => {
            // Reactions only matter when they target something we sent.
            if !sent.contains(&wire.chat, target_id) {
                tracing::debug!(
                    "whatsapp: ignoring reaction to foreign message {target_id} in {}",
                    wire.chat
                );
                return None;
            }
            msg.content_type = ContentType::Reaction;
            msg.content = emoji.clone();
            msg.reaction = Some(Reaction {
                target_id: target_id.clone(),
                emoji: emoji.clone(),
            });
        }
    }

    match policy.evaluate(&msg, self_id) {
        Ok(()) => Some(msg),
        Err(reason) => {
            tracing::warn!(
                "whatsapp: dropping message from {} in {}: {reason:?}",
                msg.sender,
                msg.chat
            );
            None
        }
    }
}

/// Consume the transport's event stream and drive the state machine.
async fn run_event_loop(inner: Arc<Inner>, mut events: mpsc::Receiver<SessionEvent>) {
    let cancel = inner.shared.cancel_token().clone();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    tracing::debug!("whatsapp: transport event stream ended");
                    break;
                }
            },
        };

        match event {
            SessionEvent::Connected => {
                inner.shared.mark_connected();
                if inner
                    .shared
                    .state
                    .transition_if_legal(ConnectionState::Connected)
                {
                    tracing::info!("whatsapp: connected");
                } else {
                    tracing::debug!(
                        "whatsapp: connected event in state {:?}, ignoring",
                        inner.shared.state.current()
                    );
                }
            }
            SessionEvent::Disconnected { reason } => {
                if matches!(
                    inner.shared.state.current(),
                    ConnectionState::Disconnected | ConnectionState::LoggingOut
                ) {
                    continue; // orderly teardown, not a loss
                }
                tracing::warn!("whatsapp: connection lost: {reason}");
                inner.shared.record_error();
                trigger_reconnect(Arc::clone(&inner));
            }
            SessionEvent::StreamReplaced => {
                tracing::warn!("whatsapp: stream replaced by another client");
                inner.shared.record_error();
                trigger_reconnect(Arc::clone(&inner));
            }
            SessionEvent::StreamError { message, fatal } => {
                inner.shared.record_error();
                if fatal {
                    tracing::error!("whatsapp: fatal stream error, giving up: {message}");
                    inner
                        .shared
                        .state
                        .transition_if_legal(ConnectionState::Disconnected);
                } else {
                    tracing::warn!("whatsapp: stream error: {message}");
                    trigger_reconnect(Arc::clone(&inner));
                }
            }
            SessionEvent::PairingCode { payload, expires_in } => {
                inner
                    .shared
                    .state
                    .transition_if_legal(ConnectionState::WaitingPairing);
                // Transports that don't report a validity window get the
                // configured default.
                let expires_in = if expires_in.is_zero() {
                    Duration::from_secs(inner.cfg.pairing.code_ttl_secs)
                } else {
                    expires_in
                };
                tracing::info!(
                    "whatsapp: pairing code received (valid {}s)",
                    expires_in.as_secs()
                );
                inner.pairing.publish(PairingEvent::Code {
                    payload,
                    message: "link this device in WhatsApp > Linked Devices".into(),
                    expires_in,
                });
            }
            SessionEvent::PairingSuccess => {
                tracing::info!("whatsapp: device linked");
                inner
                    .shared
                    .state
                    .transition_if_legal(ConnectionState::PairingConfirmed);
                inner.pairing.publish(PairingEvent::Success {
                    message: "device linked".into(),
                });
            }
            SessionEvent::PairingTimeout => {
                tracing::warn!("whatsapp: pairing window expired");
                inner.pairing.publish(PairingEvent::Timeout {
                    message: "pairing code expired, request a refresh".into(),
                });
                inner
                    .shared
                    .state
                    .transition_if_legal(ConnectionState::Disconnected);
            }
            SessionEvent::LoggedOut => {
                tracing::warn!("whatsapp: logged out by the platform, re-pairing required");
                inner.pairing.clear();
                inner
                    .shared
                    .state
                    .transition_if_legal(ConnectionState::Disconnected);
            }
            SessionEvent::TemporaryBan { message } => {
                tracing::error!("whatsapp: temporarily banned: {message}");
                inner
                    .shared
                    .state
                    .transition_if_legal(ConnectionState::Banned);
            }
            SessionEvent::Message(wire) => {
                inner.shared.touch();
                inner.shared.clear_errors();
                let self_id = inner
                    .transport
                    .self_id()
                    .map(|jid| WhatsAppChannel::normalize_phone(&jid));
                if let Some(msg) =
                    normalize_wire(&wire, &inner.sent, &inner.policy, self_id.as_deref())
                {
                    inner.queue.push(msg);
                }
            }
        }
    }
}

/// Kick off a reconnection sequence unless one is already in flight.
fn trigger_reconnect(inner: Arc<Inner>) {
    let Some(guard) = inner.flight.try_begin() else {
        tracing::debug!("whatsapp: reconnect already in flight");
        return;
    };
    if !inner
        .shared
        .state
        .transition_if_legal(ConnectionState::Reconnecting)
        && inner.shared.state.current() != ConnectionState::Reconnecting
    {
        // Terminal or tearing down; nothing to recover.
        return;
    }
    tokio::spawn(async move {
        run_reconnect(inner, guard).await;
    });
}

async fn run_reconnect(inner: Arc<Inner>, _guard: crate::reconnect::FlightGuard) {
    let cancel = inner.shared.cancel_token().clone();
    let mut state_rx = inner.shared.state.subscribe();
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let Some((attempt, delay)) =
            crate::reconnect::next_backoff(&inner.shared, &inner.reconnect_policy)
        else {
            tracing::error!(
                "whatsapp: giving up after {} reconnect attempts",
                inner.shared.attempts()
            );
            inner
                .shared
                .state
                .transition_if_legal(ConnectionState::Disconnected);
            return;
        };
        tracing::info!(
            "whatsapp: reconnect attempt {attempt} in {}s",
            delay.as_secs()
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        // Tear down stale transport state so a half-closed session can't
        // answer the new connect with "already connected".
        inner.transport.disconnect().await;
        match inner.transport.connect().await {
            Ok(()) => {
                let confirmed = tokio::time::timeout(
                    CONNECT_CONFIRM_TIMEOUT,
                    state_rx.wait_for(|s| *s == ConnectionState::Connected),
                )
                .await;
                match confirmed {
                    Ok(Ok(_)) => {
                        tracing::info!("whatsapp: reconnected after {attempt} attempt(s)");
                        return;
                    }
                    _ => {
                        inner.shared.record_error();
                        tracing::warn!(
                            "whatsapp: attempt {attempt} got no connected confirmation"
                        );
                    }
                }
            }
            Err(e) => {
                inner.shared.record_error();
                tracing::warn!("whatsapp: reconnect attempt {attempt} failed: {e}");
            }
        }
    }
}

struct TransportProbe(Arc<dyn SessionTransport>);

#[async_trait]
impl ConnectivityProbe for TransportProbe {
    async fn transport_alive(&self) -> bool {
        self.0.alive().await
    }
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let inner = &self.inner;
        if inner.shared.is_connected() {
            return Ok(());
        }
        inner.shared.state.transition(ConnectionState::Connecting)?;

        let events = inner.transport.take_events().ok_or_else(|| {
            ChannelError::Transport("transport event stream already consumed".into())
        })?;

        if !inner.transport.has_session() {
            tracing::info!("whatsapp: no stored session, starting pairing flow");
            inner
                .shared
                .state
                .transition(ConnectionState::WaitingPairing)?;
        }

        tokio::spawn(run_event_loop(Arc::clone(inner), events));

        let trigger: Arc<dyn Fn(StaleReason) + Send + Sync> = {
            let inner = Arc::clone(inner);
            Arc::new(move |_reason| trigger_reconnect(Arc::clone(&inner)))
        };
        spawn_watchdog(
            Arc::clone(&inner.shared),
            inner.cfg.health.clone(),
            Arc::new(TransportProbe(Arc::clone(&inner.transport))),
            trigger,
        );
        let keepalive_transport = Arc::clone(&inner.transport);
        spawn_keepalive(
            Arc::clone(&inner.shared),
            inner.cfg.health.keepalive_interval(),
            move || {
                let transport = Arc::clone(&keepalive_transport);
                async move {
                    transport
                        .send_presence(true)
                        .await
                        .map_err(|e| ChannelError::Transport(e.to_string()))
                }
            },
        );

        inner.transport.connect().await.map_err(|e| {
            inner.shared.record_error();
            inner
                .shared
                .state
                .transition_if_legal(ConnectionState::Disconnected);
            ChannelError::Transport(e.to_string())
        })
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        let inner = &self.inner;
        if inner.shared.state.current() == ConnectionState::Disconnected {
            return Ok(());
        }
        inner.shared.cancel_token().cancel();
        inner.transport.disconnect().await;
        inner.queue.close();
        inner
            .shared
            .state
            .transition_if_legal(ConnectionState::Disconnected);
        Ok(())
    }

    async fn send(&self, recipient: &str, message: &OutboundMessage) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;

        let Some(content) = strip_reasoning(&message.content) else {
            tracing::debug!("whatsapp: outbound message was all reasoning, suppressed");
            return Ok(());
        };
        if !self.number_allowed(recipient) {
            tracing::warn!("whatsapp: recipient {recipient} not in allowed list");
            return Ok(());
        }
        let chat = Self::recipient_to_jid(recipient)?;
        let id = self
            .inner
            .transport
            .send_text(&chat, &content, message.reply_to.as_deref())
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        self.inner.sent.insert(&chat, &id);
        self.inner.shared.touch();
        tracing::debug!("whatsapp: sent message {id} to {chat}");
        Ok(())
    }

    fn inbound(&self) -> Option<ReceiverStream<InboundMessage>> {
        self.inner.queue.take_stream()
    }

    fn is_connected(&self) -> bool {
        self.inner.shared.is_connected()
    }

    fn health(&self) -> HealthSnapshot {
        let mut detail = BTreeMap::new();
        detail.insert(
            "queue_capacity".into(),
            self.inner.queue.capacity().to_string(),
        );
        detail.insert(
            "queue_dropped".into(),
            self.inner.queue.dropped().to_string(),
        );
        detail.insert(
            "pairing_subscribers".into(),
            self.inner.pairing.subscriber_count().to_string(),
        );
        detail.insert(
            "has_session".into(),
            self.inner.transport.has_session().to_string(),
        );
        HealthSnapshot::of(&self.inner.shared, detail)
    }

    fn media(&self) -> Option<&dyn MediaSupport> {
        Some(self)
    }

    fn presence(&self) -> Option<&dyn PresenceSupport> {
        Some(self)
    }

    fn reactions(&self) -> Option<&dyn ReactionSupport> {
        Some(self)
    }
}

#[async_trait]
impl MediaSupport for WhatsAppChannel {
    async fn send_media(
        &self,
        recipient: &str,
        media: &MediaMessage,
    ) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        if !self.number_allowed(recipient) {
            tracing::warn!("whatsapp: media recipient {recipient} not in allowed list");
            return Ok(());
        }
        let chat = Self::recipient_to_jid(recipient)?;
        let id = self
            .inner
            .transport
            .send_media(&chat, media)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        self.inner.sent.insert(&chat, &id);
        self.inner.shared.touch();
        Ok(())
    }

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        self.inner
            .transport
            .download(media)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }
}

#[async_trait]
impl PresenceSupport for WhatsAppChannel {
    async fn send_typing(&self, chat: &str, typing: bool) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        let chat = Self::recipient_to_jid(chat)?;
        self.inner
            .transport
            .send_chat_state(&chat, typing)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn send_presence(&self, presence: Presence) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        self.inner
            .transport
            .send_presence(presence == Presence::Available)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn mark_read(&self, chat: &str, message_ids: &[String]) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        let chat = Self::recipient_to_jid(chat)?;
        self.inner
            .transport
            .mark_read(&chat, message_ids)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl ReactionSupport for WhatsAppChannel {
    async fn send_reaction(
        &self,
        chat: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        let chat = Self::recipient_to_jid(chat)?;
        self.inner
            .transport
            .send_reaction(&chat, message_id, emoji)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupPolicy;

    fn wire_text(sender: &str, chat: &str, body: &str) -> WireMessage {
        WireMessage {
            id: "m1".into(),
            chat: chat.into(),
            sender: sender.into(),
            push_name: Some("Alice".into()),
            is_group: false,
            is_from_me: false,
            timestamp_ms: 1_700_000_000_000,
            content: WireContent::Text { body: body.into() },
            quoted: None,
        }
    }

    fn open_policy() -> InboundPolicy {
        InboundPolicy {
            allowed_senders: vec!["*".into()],
            ..InboundPolicy::default()
        }
    }

    #[test]
    fn normalize_phone_adds_plus() {
        assert_eq!(WhatsAppChannel::normalize_phone("1234567890"), "+1234567890");
        assert_eq!(WhatsAppChannel::normalize_phone("+1234567890"), "+1234567890");
    }

    #[test]
    fn normalize_phone_from_jid() {
        assert_eq!(
            WhatsAppChannel::normalize_phone("1234567890@s.whatsapp.net"),
            "+1234567890"
        );
    }

    #[test]
    fn recipient_to_jid_accepts_jid_and_number() {
        assert_eq!(
            WhatsAppChannel::recipient_to_jid("123@g.us").unwrap(),
            "123@g.us"
        );
        assert_eq!(
            WhatsAppChannel::recipient_to_jid("+1 (555) 123-4567").unwrap(),
            "15551234567@s.whatsapp.net"
        );
    }

    #[test]
    fn recipient_to_jid_rejects_garbage() {
        assert!(matches!(
            WhatsAppChannel::recipient_to_jid("   "),
            Err(ChannelError::InvalidRecipient(_))
        ));
        assert!(matches!(
            WhatsAppChannel::recipient_to_jid("no-digits-here"),
            Err(ChannelError::InvalidRecipient(_))
        ));
    }

    #[test]
    fn normalize_wire_builds_canonical_text() {
        let sent = SentMessageCache::new(8);
        let msg = normalize_wire(
            &wire_text("15551234567@s.whatsapp.net", "15551234567@s.whatsapp.net", "hello"),
            &sent,
            &open_policy(),
            None,
        )
        .unwrap();
        assert_eq!(msg.sender, "+15551234567");
        assert_eq!(msg.sender_name.as_deref(), Some("Alice"));
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.content_type, ContentType::Text);
        assert_eq!(msg.metadata["jid"], "15551234567@s.whatsapp.net");
    }

    #[test]
    fn normalize_wire_drops_own_messages() {
        let sent = SentMessageCache::new(8);
        let mut wire = wire_text("1@s.whatsapp.net", "1@s.whatsapp.net", "hi");
        wire.is_from_me = true;
        assert!(normalize_wire(&wire, &sent, &open_policy(), None).is_none());
    }

    #[test]
    fn normalize_wire_drops_empty_text() {
        let sent = SentMessageCache::new(8);
        let wire = wire_text("1@s.whatsapp.net", "1@s.whatsapp.net", "   ");
        assert!(normalize_wire(&wire, &sent, &open_policy(), None).is_none());
    }

    #[test]
    fn normalize_wire_enforces_allowlist() {
        let sent = SentMessageCache::new(8);
        let policy = InboundPolicy {
            allowed_senders: vec!["+15551234567".into()],
            ..InboundPolicy::default()
        };
        let allowed = wire_text("15551234567@s.whatsapp.net", "c", "hi");
        let denied = wire_text("19998887777@s.whatsapp.net", "c", "hi");
        assert!(normalize_wire(&allowed, &sent, &policy, None).is_some());
        assert!(normalize_wire(&denied, &sent, &policy, None).is_none());
    }

    #[test]
    fn normalize_wire_group_policy_applies() {
        let sent = SentMessageCache::new(8);
        let policy = InboundPolicy {
            allowed_senders: vec!["*".into()],
            group_policy: GroupPolicy::DirectOnly,
            ..InboundPolicy::default()
        };
        let mut wire = wire_text("1@s.whatsapp.net", "g1@g.us", "hi");
        wire.is_group = true;
        assert!(normalize_wire(&wire, &sent, &policy, None).is_none());
    }

    #[test]
    fn reaction_to_own_message_is_delivered() {
        let sent = SentMessageCache::new(8);
        sent.insert("chat@s.whatsapp.net", "our-msg");
        let mut wire = wire_text("1@s.whatsapp.net", "chat@s.whatsapp.net", "");
        wire.content = WireContent::Reaction {
            target_id: "our-msg".into(),
            emoji: "👍".into(),
        };
        let msg = normalize_wire(&wire, &sent, &open_policy(), None).unwrap();
        assert_eq!(msg.content_type, ContentType::Reaction);
        assert_eq!(msg.reaction.unwrap().target_id, "our-msg");
    }

    #[test]
    fn reaction_to_foreign_message_is_dropped() {
        let sent = SentMessageCache::new(8);
        let mut wire = wire_text("1@s.whatsapp.net", "chat@s.whatsapp.net", "");
        wire.content = WireContent::Reaction {
            target_id: "someone-elses".into(),
            emoji: "👍".into(),
        };
        assert!(normalize_wire(&wire, &sent, &open_policy(), None).is_none());
    }

    #[test]
    fn normalize_wire_maps_media_kinds() {
        let sent = SentMessageCache::new(8);
        let mut wire = wire_text("1@s.whatsapp.net", "c", "");
        wire.content = WireContent::Media {
            kind: MediaKind::Document,
            caption: "the report".into(),
            media: MediaRef {
                id: Some("file-1".into()),
                mime_type: Some("application/pdf".into()),
                ..MediaRef::default()
            },
        };
        let msg = normalize_wire(&wire, &sent, &open_policy(), None).unwrap();
        assert_eq!(msg.content_type, ContentType::Document);
        assert_eq!(msg.content, "the report");
        assert_eq!(msg.media.unwrap().id.as_deref(), Some("file-1"));
    }

    #[test]
    fn normalize_wire_carries_quotes() {
        let sent = SentMessageCache::new(8);
        let mut wire = wire_text("1@s.whatsapp.net", "c", "replying");
        wire.quoted = Some(("orig-id".into(), "original text".into()));
        let msg = normalize_wire(&wire, &sent, &open_policy(), None).unwrap();
        assert_eq!(msg.reply_to.as_deref(), Some("orig-id"));
        assert_eq!(msg.quoted_text.as_deref(), Some("original text"));
    }
}
