//! Discord channel — persistent gateway WebSocket plus REST sends.
//!
//! The gateway supervisor owns the connection lifecycle: Hello/Identify
//! handshake, heartbeating, and reconnection with backoff. READY is the
//! asynchronous Connected confirmation. Sends, typing and reactions go
//! through the REST API. A simplified lifecycle subset with no pairing and
//! no ban state.

use crate::config::DiscordConfig;
use crate::error::ChannelError;
use crate::health::{spawn_watchdog, ConnectivityProbe, HealthSnapshot, StaleReason};
use crate::interactions::{InteractionEvent, InteractionRegistry};
use crate::message::{
    ContentType, InboundMessage, MediaMessage, MediaRef, MediaSource, OutboundMessage, Reaction,
};
use crate::policy::{strip_reasoning, InboundPolicy};
use crate::queue::DeliveryQueue;
use crate::reconnect::ReconnectPolicy;
use crate::runtime::ConnectionShared;
use crate::sent_cache::SentMessageCache;
use crate::state::ConnectionState;
use crate::traits::{Channel, MediaSupport, Presence, PresenceSupport, ReactionSupport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// GUILDS | GUILD_MESSAGES | GUILD_MESSAGE_REACTIONS | DIRECT_MESSAGES |
/// DIRECT_MESSAGE_REACTIONS | MESSAGE_CONTENT
const GATEWAY_INTENTS: u64 =
    (1 << 0) | (1 << 9) | (1 << 10) | (1 << 12) | (1 << 13) | (1 << 15);

struct Inner {
    cfg: DiscordConfig,
    http: reqwest::Client,
    api_base: String,
    shared: Arc<ConnectionShared>,
    policy: InboundPolicy,
    queue: DeliveryQueue,
    sent: SentMessageCache,
    interactions: Arc<InteractionRegistry>,
    reconnect_policy: ReconnectPolicy,
    /// Own user id, learned from READY.
    self_id: Mutex<Option<String>>,
    /// Cancelling this token tears down the current gateway session; the
    /// supervisor then reconnects. This is the forced-reconnect entry point.
    session_cancel: Mutex<Option<CancellationToken>>,
}

/// Discord adapter.
pub struct DiscordChannel {
    inner: Arc<Inner>,
}

impl DiscordChannel {
    pub fn new(cfg: DiscordConfig, parent: &CancellationToken) -> Self {
        let policy = InboundPolicy {
            allowed_senders: cfg.allowed_users.clone(),
            blocked_senders: cfg.blocked_users.clone(),
            allowed_chats: cfg.allowed_channels.clone(),
            group_policy: cfg.group_policy,
        };
        let inner = Inner {
            http: reqwest::Client::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            shared: Arc::new(ConnectionShared::new("discord", parent)),
            policy,
            queue: DeliveryQueue::new("discord", cfg.queue_capacity),
            sent: SentMessageCache::default(),
            interactions: Arc::new(InteractionRegistry::new(Duration::from_secs(
                cfg.interaction_ttl_secs,
            ))),
            reconnect_policy: ReconnectPolicy::from_config(&cfg.reconnect),
            self_id: Mutex::new(None),
            session_cancel: Mutex::new(None),
            cfg,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Point the REST client somewhere else (tests, proxies).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_api_base must be called before the adapter is shared");
        inner.api_base = base.into();
        self
    }

    /// Registry for short-lived button/menu handlers.
    pub fn interactions(&self) -> Arc<InteractionRegistry> {
        Arc::clone(&self.inner.interactions)
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.inner.cfg.bot_token)
    }

    async fn check_response(resp: reqwest::Response, what: &str) -> Result<serde_json::Value, ChannelError> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ChannelError::SendFailed(format!(
                "discord {what} failed ({status}): {body}"
            )));
        }
        Ok(serde_json::from_str(&body).unwrap_or(serde_json::Value::Null))
    }
}

/// Why one gateway session ended.
enum SessionEnd {
    /// Parent cancellation; shut down for good.
    Shutdown,
    /// Recoverable loss; the supervisor reconnects with backoff.
    Lost(String),
    /// Non-retryable close (bad token, bad intents).
    Fatal(String),
}

/// Drive gateway sessions forever, reconnecting with backoff on loss.
async fn run_supervisor(inner: Arc<Inner>) {
    let cancel = inner.shared.cancel_token().clone();
    loop {
        match run_session(&inner).await {
            SessionEnd::Shutdown => return,
            SessionEnd::Fatal(reason) => {
                tracing::error!("discord: non-retryable gateway failure: {reason}");
                inner
                    .shared
                    .state
                    .transition_if_legal(ConnectionState::Disconnected);
                return;
            }
            SessionEnd::Lost(reason) => {
                tracing::warn!("discord: gateway session lost: {reason}");
                inner.shared.record_error();
                inner
                    .shared
                    .state
                    .transition_if_legal(ConnectionState::Reconnecting);
            }
        }

        // Backoff before the next session. One supervisor per adapter, so
        // concurrent loss signals can't start competing sequences.
        let Some((attempt, delay)) =
            crate::reconnect::next_backoff(&inner.shared, &inner.reconnect_policy)
        else {
            tracing::error!(
                "discord: giving up after {} reconnect attempts",
                inner.shared.attempts()
            );
            inner
                .shared
                .state
                .transition_if_legal(ConnectionState::Disconnected);
            return;
        };
        tracing::info!("discord: reconnect attempt {attempt} in {}s", delay.as_secs());
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Run one gateway session until it ends.
async fn run_session(inner: &Arc<Inner>) -> SessionEnd {
    let parent = inner.shared.cancel_token().clone();
    let session = parent.child_token();
    *inner.session_cancel.lock() = Some(session.clone());

    let (ws, _) = match tokio_tungstenite::connect_async(GATEWAY_URL).await {
        Ok(ok) => ok,
        Err(e) => return SessionEnd::Lost(format!("gateway connect: {e}")),
    };
    let (mut write, mut read) = ws.split();
    let mut heartbeat: Option<tokio::time::Interval> = None;
    let mut last_seq: Option<u64> = None;

    enum Step {
        Shutdown,
        Forced,
        Heartbeat,
        Frame(Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>),
    }

    loop {
        // The select only picks what happened; all handling runs afterwards
        // so the heartbeat interval can be installed once Hello arrives.
        let step = {
            let hb_tick = async {
                match heartbeat.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = parent.cancelled() => Step::Shutdown,
                _ = session.cancelled() => Step::Forced,
                _ = hb_tick => Step::Heartbeat,
                frame = read.next() => Step::Frame(frame),
            }
        };

        let frame = match step {
            Step::Shutdown => {
                let _ = write.send(WsMessage::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            Step::Forced => {
                let _ = write.send(WsMessage::Close(None)).await;
                return SessionEnd::Lost("session teardown forced".into());
            }
            Step::Heartbeat => {
                let beat = serde_json::json!({ "op": 1, "d": last_seq });
                if let Err(e) = write.send(WsMessage::text(beat.to_string())).await {
                    return SessionEnd::Lost(format!("heartbeat send: {e}"));
                }
                continue;
            }
            Step::Frame(frame) => frame,
        };

        let text = match frame {
            Some(Ok(WsMessage::Text(t))) => t,
            Some(Ok(WsMessage::Close(close))) => {
                let code = close.as_ref().map(|c| u16::from(c.code)).unwrap_or(1000);
                let reason = format!("gateway closed ({code})");
                // Authentication and intent errors never heal on retry.
                return if matches!(code, 4004 | 4010..=4014) {
                    SessionEnd::Fatal(reason)
                } else {
                    SessionEnd::Lost(reason)
                };
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return SessionEnd::Lost(format!("gateway read: {e}")),
            None => return SessionEnd::Lost("gateway stream ended".into()),
        };
        let payload: serde_json::Value = match serde_json::from_str(text.as_str()) {
            Ok(v) => v,
            Err(_) => {
                // Malformed frame: drop it, count it, keep reading.
                inner.shared.record_malformed();
                continue;
            }
        };
        if let Some(seq) = payload.get("s").and_then(serde_json::Value::as_u64) {
            last_seq = Some(seq);
        }
        match payload.get("op").and_then(serde_json::Value::as_u64) {
            Some(10) => {
                let interval_ms = payload["d"]["heartbeat_interval"]
                    .as_u64()
                    .unwrap_or(41_250);
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                // First tick is immediate; consume it so heartbeats start one
                // interval from now.
                ticker.tick().await;
                heartbeat = Some(ticker);

                let identify = serde_json::json!({
                    "op": 2,
                    "d": {
                        "token": inner.cfg.bot_token,
                        "intents": GATEWAY_INTENTS,
                        "properties": {
                            "os": std::env::consts::OS,
                            "browser": "emberclaw",
                            "device": "emberclaw",
                        },
                    },
                });
                if let Err(e) = write.send(WsMessage::text(identify.to_string())).await {
                    return SessionEnd::Lost(format!("identify send: {e}"));
                }
            }
            Some(11) => inner.shared.touch(), // heartbeat ack
            Some(1) => {
                let beat = serde_json::json!({ "op": 1, "d": last_seq });
                if let Err(e) = write.send(WsMessage::text(beat.to_string())).await {
                    return SessionEnd::Lost(format!("heartbeat send: {e}"));
                }
            }
            Some(7) => return SessionEnd::Lost("server requested reconnect".into()),
            Some(9) => return SessionEnd::Lost("session invalidated".into()),
            Some(0) => handle_dispatch(inner, &payload),
            _ => {}
        }
    }
}

fn handle_dispatch(inner: &Arc<Inner>, payload: &serde_json::Value) {
    let kind = payload.get("t").and_then(|t| t.as_str()).unwrap_or("");
    let d = &payload["d"];
    match kind {
        "READY" => {
            let user_id = d["user"]["id"].as_str().unwrap_or_default().to_string();
            tracing::info!("discord: gateway ready as user {user_id}");
            *inner.self_id.lock() = Some(user_id);
            inner.shared.mark_connected();
            inner
                .shared
                .state
                .transition_if_legal(ConnectionState::Connected);
        }
        "MESSAGE_CREATE" => {
            inner.shared.touch();
            let self_id = inner.self_id.lock().clone();
            if let Some(msg) = normalize_message(d, &inner.policy, self_id.as_deref()) {
                inner.queue.push(msg);
            }
        }
        "MESSAGE_REACTION_ADD" => {
            inner.shared.touch();
            let self_id = inner.self_id.lock().clone();
            if let Some(msg) =
                normalize_reaction(d, &inner.sent, &inner.policy, self_id.as_deref())
            {
                inner.queue.push(msg);
            }
        }
        "INTERACTION_CREATE" => {
            inner.shared.touch();
            let registry = Arc::clone(&inner.interactions);
            let component_id = d["data"]["custom_id"].as_str().unwrap_or_default().to_string();
            if component_id.is_empty() {
                return;
            }
            let event = InteractionEvent {
                component_id,
                interaction_id: d["id"].as_str().unwrap_or_default().to_string(),
                token: d["token"].as_str().map(String::from),
                user: d["member"]["user"]["id"]
                    .as_str()
                    .or_else(|| d["user"]["id"].as_str())
                    .unwrap_or_default()
                    .to_string(),
                chat: d["channel_id"].as_str().unwrap_or_default().to_string(),
            };
            tokio::spawn(async move {
                let outcome = registry.dispatch(event).await;
                tracing::debug!("discord: interaction dispatch: {outcome:?}");
            });
        }
        _ => {}
    }
}

/// Map a MESSAGE_CREATE payload into the canonical model.
fn normalize_message(
    d: &serde_json::Value,
    policy: &InboundPolicy,
    self_id: Option<&str>,
) -> Option<InboundMessage> {
    if d["author"]["bot"].as_bool().unwrap_or(false) {
        return None;
    }
    let sender = d["author"]["id"].as_str()?.to_string();
    let chat = d["channel_id"].as_str()?.to_string();
    let content = d["content"].as_str().unwrap_or("").to_string();
    let is_group = d.get("guild_id").and_then(|g| g.as_str()).is_some();

    let mut msg = InboundMessage::text("discord", sender, chat, content);
    msg.id = d["id"].as_str().unwrap_or(&msg.id).to_string();
    msg.is_group = is_group;
    msg.sender_name = d["author"]["username"].as_str().map(String::from);
    if let Some(ts) = d["timestamp"]
        .as_str()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
    {
        msg.timestamp = ts.with_timezone(&Utc);
    }
    if let Some(guild) = d.get("guild_id").and_then(|g| g.as_str()) {
        msg.metadata
            .insert("guild_id".into(), serde_json::Value::String(guild.into()));
    }
    if let Some(referenced) = d.get("referenced_message").filter(|r| !r.is_null()) {
        msg.reply_to = referenced["id"].as_str().map(String::from);
        msg.quoted_text = referenced["content"].as_str().map(String::from);
    }
    if let Some(attachment) = d["attachments"].as_array().and_then(|a| a.first()) {
        let mime = attachment["content_type"].as_str().unwrap_or("");
        msg.content_type = if mime.starts_with("image/") {
            ContentType::Image
        } else if mime.starts_with("audio/") {
            ContentType::Audio
        } else if mime.starts_with("video/") {
            ContentType::Video
        } else {
            ContentType::Document
        };
        msg.media = Some(MediaRef {
            id: attachment["id"].as_str().map(String::from),
            url: attachment["url"].as_str().map(String::from),
            mime_type: attachment["content_type"].as_str().map(String::from),
            size_bytes: attachment["size"].as_u64(),
            file_name: attachment["filename"].as_str().map(String::from),
        });
    }
    if msg.content.is_empty() && msg.media.is_none() {
        return None;
    }

    apply_policy(policy, msg, d.get("guild_id").and_then(|g| g.as_str()), self_id)
}

/// Shared filter chain for message and reaction payloads. The chat allowlist
/// accepts either the channel id or its enclosing guild id.
fn apply_policy(
    policy: &InboundPolicy,
    msg: InboundMessage,
    guild: Option<&str>,
    self_id: Option<&str>,
) -> Option<InboundMessage> {
    if self_id.is_some_and(|own| !own.is_empty() && own == msg.sender) {
        tracing::debug!("discord: suppressing own message {}", msg.id);
        return None;
    }
    if !policy.sender_allowed([msg.sender.as_str()]) {
        tracing::warn!(
            "discord: ignoring message from unauthorized user {}",
            msg.sender
        );
        return None;
    }
    let chat_ids = std::iter::once(msg.chat.as_str()).chain(guild);
    if !policy.chat_allowed_any(chat_ids) {
        tracing::warn!("discord: dropping message in unlisted channel {}", msg.chat);
        return None;
    }
    if !policy.group_allowed(msg.is_group) {
        tracing::debug!("discord: dropping message in {} per group policy", msg.chat);
        return None;
    }
    Some(msg)
}

/// Map a MESSAGE_REACTION_ADD payload; only reactions to our own messages
/// are delivered.
fn normalize_reaction(
    d: &serde_json::Value,
    sent: &SentMessageCache,
    policy: &InboundPolicy,
    self_id: Option<&str>,
) -> Option<InboundMessage> {
    let chat = d["channel_id"].as_str()?.to_string();
    let target = d["message_id"].as_str()?.to_string();
    if !sent.contains(&chat, &target) {
        return None;
    }
    let sender = d["user_id"].as_str()?.to_string();
    let emoji = d["emoji"]["name"].as_str().unwrap_or("").to_string();

    let mut msg = InboundMessage::text("discord", sender, chat, emoji.clone());
    msg.content_type = ContentType::Reaction;
    msg.is_group = d.get("guild_id").and_then(|g| g.as_str()).is_some();
    msg.reaction = Some(Reaction {
        target_id: target,
        emoji,
    });

    apply_policy(policy, msg, d.get("guild_id").and_then(|g| g.as_str()), self_id)
}

struct SessionProbe(Arc<Inner>);

#[async_trait]
impl ConnectivityProbe for SessionProbe {
    async fn transport_alive(&self) -> bool {
        self.0
            .session_cancel
            .lock()
            .as_ref()
            .map(|token| !token.is_cancelled())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let inner = &self.inner;
        if inner.shared.is_connected() {
            return Ok(());
        }
        inner.shared.state.transition(ConnectionState::Connecting)?;

        tokio::spawn(run_supervisor(Arc::clone(inner)));
        crate::interactions::spawn_sweeper(
            Arc::clone(&inner.interactions),
            Duration::from_secs(60),
            inner.shared.cancel_token().clone(),
        );
        let trigger: Arc<dyn Fn(StaleReason) + Send + Sync> = {
            let inner = Arc::clone(inner);
            Arc::new(move |_reason| {
                // Tearing down the session makes the supervisor reconnect;
                // repeated triggers hit an already-cancelled token.
                if let Some(session) = inner.session_cancel.lock().as_ref() {
                    session.cancel();
                }
            })
        };
        spawn_watchdog(
            Arc::clone(&inner.shared),
            inner.cfg.health.clone(),
            Arc::new(SessionProbe(Arc::clone(inner))),
            trigger,
        );
        // The gateway heartbeat doubles as the keepalive; no separate ticker.
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        let inner = &self.inner;
        if inner.shared.state.current() == ConnectionState::Disconnected {
            return Ok(());
        }
        inner.shared.cancel_token().cancel();
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
            tracing::debug!("discord: outbound message was all reasoning, suppressed");
            return Ok(());
        };
        if recipient.trim().is_empty() || !recipient.chars().all(|c| c.is_ascii_digit()) {
            return Err(ChannelError::InvalidRecipient(recipient.to_string()));
        }

        let mut body = serde_json::json!({ "content": content });
        if let Some(reply_to) = &message.reply_to {
            body["message_reference"] = serde_json::json!({ "message_id": reply_to });
        }
        let resp = self
            .inner
            .http
            .post(format!(
                "{}/channels/{recipient}/messages",
                self.inner.api_base
            ))
            .header("Authorization", self.auth())
            .json(&body)
            .send()
            .await?;
        let value = Self::check_response(resp, "message send").await?;
        if let Some(id) = value["id"].as_str() {
            self.inner.sent.insert(recipient, id);
        }
        self.inner.shared.touch();
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
            "pending_interactions".into(),
            self.inner.interactions.len().to_string(),
        );
        detail.insert(
            "malformed_dropped".into(),
            self.inner.shared.malformed().to_string(),
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
impl MediaSupport for DiscordChannel {
    async fn send_media(
        &self,
        recipient: &str,
        media: &MediaMessage,
    ) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        let url = format!("{}/channels/{recipient}/messages", self.inner.api_base);
        let resp = match &media.source {
            MediaSource::Url(remote) => {
                // Discord unfurls plain links; no upload round-trip needed.
                let content = match &media.caption {
                    Some(caption) => format!("{caption}\n{remote}"),
                    None => remote.clone(),
                };
                self.inner
                    .http
                    .post(&url)
                    .header("Authorization", self.auth())
                    .json(&serde_json::json!({ "content": content }))
                    .send()
                    .await?
            }
            MediaSource::Bytes(bytes) => {
                let file_name = media
                    .file_name
                    .clone()
                    .unwrap_or_else(|| "attachment".to_string());
                let payload = serde_json::json!({
                    "content": media.caption.clone().unwrap_or_default(),
                    "attachments": [{ "id": 0, "filename": file_name }],
                });
                let part = reqwest::multipart::Part::bytes(bytes.clone())
                    .file_name(file_name)
                    .mime_str(&media.mime_type)
                    .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
                let form = reqwest::multipart::Form::new()
                    .text("payload_json", payload.to_string())
                    .part("files[0]", part);
                self.inner
                    .http
                    .post(&url)
                    .header("Authorization", self.auth())
                    .multipart(form)
                    .send()
                    .await?
            }
        };
        let value = Self::check_response(resp, "media send").await?;
        if let Some(id) = value["id"].as_str() {
            self.inner.sent.insert(recipient, id);
        }
        self.inner.shared.touch();
        Ok(())
    }

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        let url = media
            .url
            .as_deref()
            .ok_or_else(|| ChannelError::Transport("media descriptor has no url".into()))?;
        let resp = self.inner.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(ChannelError::Transport(format!(
                "media download failed ({})",
                resp.status()
            )));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl PresenceSupport for DiscordChannel {
    async fn send_typing(&self, chat: &str, typing: bool) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        if !typing {
            // Discord typing indicators expire on their own; nothing to send.
            return Ok(());
        }
        let resp = self
            .inner
            .http
            .post(format!("{}/channels/{chat}/typing", self.inner.api_base))
            .header("Authorization", self.auth())
            .send()
            .await?;
        Self::check_response(resp, "typing").await?;
        Ok(())
    }

    async fn send_presence(&self, _presence: Presence) -> Result<(), ChannelError> {
        // Gateway presence is refreshed by the heartbeat; there is no REST
        // surface for it.
        Err(ChannelError::NotSupported("presence updates"))
    }

    async fn mark_read(&self, _chat: &str, _message_ids: &[String]) -> Result<(), ChannelError> {
        Err(ChannelError::NotSupported("read receipts"))
    }
}

#[async_trait]
impl ReactionSupport for DiscordChannel {
    async fn send_reaction(
        &self,
        chat: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        let encoded = urlencoding::encode(emoji);
        let resp = self
            .inner
            .http
            .put(format!(
                "{}/channels/{chat}/messages/{message_id}/reactions/{encoded}/@me",
                self.inner.api_base
            ))
            .header("Authorization", self.auth())
            .send()
            .await?;
        Self::check_response(resp, "reaction").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupPolicy;

    fn open_policy() -> InboundPolicy {
        InboundPolicy {
            allowed_senders: vec!["*".into()],
            ..InboundPolicy::default()
        }
    }

    fn message_create(sender: &str, channel: &str, content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "111",
            "channel_id": channel,
            "content": content,
            "timestamp": "2026-01-15T10:30:00+00:00",
            "author": { "id": sender, "username": "alice", "bot": false },
        })
    }

    #[test]
    fn normalize_basic_dm() {
        let msg = normalize_message(
            &message_create("42", "C1", "hello"),
            &open_policy(),
            None,
        )
        .unwrap();
        assert_eq!(msg.channel, "discord");
        assert_eq!(msg.sender, "42");
        assert_eq!(msg.chat, "C1");
        assert!(!msg.is_group);
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.timestamp.to_rfc3339(), "2026-01-15T10:30:00+00:00");
    }

    #[test]
    fn guild_message_is_group() {
        let mut payload = message_create("42", "C1", "hello");
        payload["guild_id"] = serde_json::json!("G9");
        let msg = normalize_message(&payload, &open_policy(), None).unwrap();
        assert!(msg.is_group);
        assert_eq!(msg.metadata["guild_id"], "G9");
    }

    #[test]
    fn bot_authors_are_dropped() {
        let mut payload = message_create("42", "C1", "hello");
        payload["author"]["bot"] = serde_json::json!(true);
        assert!(normalize_message(&payload, &open_policy(), None).is_none());
    }

    #[test]
    fn self_messages_are_dropped() {
        let payload = message_create("42", "C1", "hello");
        assert!(normalize_message(&payload, &open_policy(), Some("42")).is_none());
    }

    #[test]
    fn empty_message_without_attachment_is_dropped() {
        let payload = message_create("42", "C1", "");
        assert!(normalize_message(&payload, &open_policy(), None).is_none());
    }

    #[test]
    fn attachment_maps_to_media() {
        let mut payload = message_create("42", "C1", "");
        payload["attachments"] = serde_json::json!([{
            "id": "a1",
            "url": "https://cdn.example/x.png",
            "content_type": "image/png",
            "size": 1234,
            "filename": "x.png",
        }]);
        let msg = normalize_message(&payload, &open_policy(), None).unwrap();
        assert_eq!(msg.content_type, ContentType::Image);
        let media = msg.media.unwrap();
        assert_eq!(media.url.as_deref(), Some("https://cdn.example/x.png"));
        assert_eq!(media.size_bytes, Some(1234));
    }

    #[test]
    fn reply_carries_reference() {
        let mut payload = message_create("42", "C1", "agreed");
        payload["referenced_message"] =
            serde_json::json!({ "id": "r1", "content": "original" });
        let msg = normalize_message(&payload, &open_policy(), None).unwrap();
        assert_eq!(msg.reply_to.as_deref(), Some("r1"));
        assert_eq!(msg.quoted_text.as_deref(), Some("original"));
    }

    #[test]
    fn channel_allowlist_accepts_guild_id_too() {
        let mut policy = open_policy();
        policy.allowed_chats = vec!["G9".into()];
        let mut payload = message_create("42", "C1", "hello");
        payload["guild_id"] = serde_json::json!("G9");
        assert!(normalize_message(&payload, &policy, None).is_some());

        let other = message_create("42", "C1", "hello");
        assert!(normalize_message(&other, &policy, None).is_none());
    }

    #[test]
    fn group_policy_direct_only_applies() {
        let mut policy = open_policy();
        policy.group_policy = GroupPolicy::DirectOnly;
        let mut payload = message_create("42", "C1", "hello");
        payload["guild_id"] = serde_json::json!("G9");
        assert!(normalize_message(&payload, &policy, None).is_none());
    }

    #[test]
    fn reaction_requires_own_message() {
        let sent = SentMessageCache::new(8);
        let payload = serde_json::json!({
            "channel_id": "C1",
            "message_id": "m7",
            "user_id": "42",
            "emoji": { "name": "👍" },
        });
        assert!(normalize_reaction(&payload, &sent, &open_policy(), None).is_none());

        sent.insert("C1", "m7");
        let msg = normalize_reaction(&payload, &sent, &open_policy(), None).unwrap();
        assert_eq!(msg.content_type, ContentType::Reaction);
        assert_eq!(msg.reaction.unwrap().emoji, "👍");
    }

    #[tokio::test]
    async fn send_while_disconnected_errors_without_io() {
        let cfg = DiscordConfig {
            bot_token: "t".into(),
            allowed_users: vec!["*".into()],
            blocked_users: vec![],
            allowed_channels: vec![],
            group_policy: GroupPolicy::All,
            queue_capacity: 8,
            reconnect: Default::default(),
            health: Default::default(),
            interaction_ttl_secs: 60,
        };
        let ch = DiscordChannel::new(cfg, &CancellationToken::new());
        let err = ch
            .send("123", &OutboundMessage::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Disconnected));
    }
}
