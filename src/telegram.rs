//! Telegram channel — long-polls the Bot API for updates, sends over REST.
//!
//! A simplified lifecycle subset: a bot token means no pairing flow, and
//! Telegram has no ban-notification equivalent. `getMe` doubles as the
//! connect confirmation, the keepalive and the connectivity cross-check.

use crate::config::TelegramConfig;
use crate::error::ChannelError;
use crate::health::{
    spawn_keepalive, spawn_watchdog, ConnectivityProbe, HealthSnapshot, StaleReason,
};
use crate::message::{
    ContactCard, ContentType, InboundMessage, Location, MediaMessage, MediaRef, MediaSource,
    OutboundMessage,
};
use crate::policy::{strip_reasoning, InboundPolicy};
use crate::queue::DeliveryQueue;
use crate::reconnect::ReconnectPolicy;
use crate::runtime::ConnectionShared;
use crate::state::ConnectionState;
use crate::traits::{Channel, MediaSupport, Presence, PresenceSupport, ReactionSupport};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
/// Server-side long-poll window for getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;
/// Consecutive poll failures before the adapter enters the reconnect path.
const MAX_POLL_ERRORS: u32 = 3;

struct Inner {
    cfg: TelegramConfig,
    http: reqwest::Client,
    api_base: String,
    shared: Arc<ConnectionShared>,
    policy: InboundPolicy,
    queue: DeliveryQueue,
    /// Bot's own user id, learned from getMe.
    self_id: Mutex<Option<String>>,
    /// Next getUpdates offset; exposed in health detail.
    offset: AtomicI64,
    reconnect_policy: ReconnectPolicy,
    session_cancel: Mutex<Option<CancellationToken>>,
}

impl Inner {
    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.cfg.bot_token)
    }

    async fn get_me(&self) -> Result<String, ChannelError> {
        let resp = self
            .http
            .get(self.api_url("getMe"))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        let data: serde_json::Value = resp.json().await?;
        if data["ok"].as_bool() != Some(true) {
            return Err(ChannelError::Transport(format!(
                "getMe rejected: {}",
                data["description"].as_str().unwrap_or("unknown")
            )));
        }
        data["result"]["id"]
            .as_i64()
            .map(|id| id.to_string())
            .ok_or_else(|| ChannelError::Transport("getMe result has no id".into()))
    }
}

/// Telegram adapter.
pub struct TelegramChannel {
    inner: Arc<Inner>,
}

impl TelegramChannel {
    pub fn new(cfg: TelegramConfig, parent: &CancellationToken) -> Self {
        let policy = InboundPolicy {
            allowed_senders: cfg.allowed_users.clone(),
            blocked_senders: cfg.blocked_users.clone(),
            allowed_chats: cfg.allowed_chats.clone(),
            group_policy: cfg.group_policy,
        };
        let inner = Inner {
            http: reqwest::Client::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            shared: Arc::new(ConnectionShared::new("telegram", parent)),
            policy,
            queue: DeliveryQueue::new("telegram", cfg.queue_capacity),
            self_id: Mutex::new(None),
            offset: AtomicI64::new(0),
            reconnect_policy: ReconnectPolicy::from_config(&cfg.reconnect),
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

    /// Telegram accepts numeric chat ids or `@channelname`.
    fn validate_recipient(recipient: &str) -> Result<(), ChannelError> {
        let trimmed = recipient.trim();
        let valid = trimmed.parse::<i64>().is_ok()
            || (trimmed.starts_with('@') && trimmed.len() > 1);
        if valid {
            Ok(())
        } else {
            Err(ChannelError::InvalidRecipient(recipient.to_string()))
        }
    }

    async fn call_api(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let resp = self
            .inner
            .http
            .post(self.inner.api_url(method))
            .json(&body)
            .send()
            .await?;
        let data: serde_json::Value = resp.json().await?;
        if data["ok"].as_bool() != Some(true) {
            return Err(ChannelError::SendFailed(format!(
                "telegram {method} failed: {}",
                data["description"].as_str().unwrap_or("unknown")
            )));
        }
        Ok(data["result"].clone())
    }
}

/// Bring the connection up, then poll until shutdown, reconnecting with
/// backoff on repeated failures.
async fn run_supervisor(inner: Arc<Inner>) {
    let cancel = inner.shared.cancel_token().clone();
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match inner.get_me().await {
            Ok(id) => {
                *inner.self_id.lock() = Some(id);
                inner.shared.mark_connected();
                inner
                    .shared
                    .state
                    .transition_if_legal(ConnectionState::Connected);
                tracing::info!("telegram: connected, polling for updates");
            }
            Err(e) => {
                inner.shared.record_error();
                tracing::warn!("telegram: connect check failed: {e}");
                if !backoff_or_give_up(&inner).await {
                    return;
                }
                continue;
            }
        }

        match run_poll_loop(&inner).await {
            PollEnd::Shutdown => return,
            PollEnd::Lost(reason) => {
                tracing::warn!("telegram: poll loop lost: {reason}");
                inner
                    .shared
                    .state
                    .transition_if_legal(ConnectionState::Reconnecting);
                if !backoff_or_give_up(&inner).await {
                    return;
                }
            }
        }
    }
}

/// Returns false when the attempt budget is spent (terminal Disconnected).
async fn backoff_or_give_up(inner: &Arc<Inner>) -> bool {
    let Some((attempt, delay)) =
        crate::reconnect::next_backoff(&inner.shared, &inner.reconnect_policy)
    else {
        tracing::error!(
            "telegram: giving up after {} reconnect attempts",
            inner.shared.attempts()
        );
        inner
            .shared
            .state
            .transition_if_legal(ConnectionState::Disconnected);
        return false;
    };
    tracing::info!("telegram: reconnect attempt {attempt} in {}s", delay.as_secs());
    tokio::select! {
        _ = inner.shared.cancel_token().cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

enum PollEnd {
    Shutdown,
    Lost(String),
}

async fn run_poll_loop(inner: &Arc<Inner>) -> PollEnd {
    let parent = inner.shared.cancel_token().clone();
    let session = parent.child_token();
    *inner.session_cancel.lock() = Some(session.clone());

    loop {
        let body = serde_json::json!({
            "offset": inner.offset.load(Ordering::Relaxed),
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["message"],
        });
        let request = inner.http.post(inner.api_url("getUpdates")).json(&body);

        let resp = tokio::select! {
            _ = parent.cancelled() => return PollEnd::Shutdown,
            _ = session.cancelled() => return PollEnd::Lost("poll session teardown forced".into()),
            resp = request.send() => resp,
        };

        let data: serde_json::Value = match resp {
            Ok(r) => match r.json().await {
                Ok(d) => d,
                Err(e) => {
                    if inner.shared.record_error() >= MAX_POLL_ERRORS {
                        return PollEnd::Lost(format!("parse error: {e}"));
                    }
                    tracing::warn!("telegram: parse error: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            },
            Err(e) => {
                if inner.shared.record_error() >= MAX_POLL_ERRORS {
                    return PollEnd::Lost(format!("poll error: {e}"));
                }
                tracing::warn!("telegram: poll error: {e}");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        inner.shared.clear_errors();
        inner.shared.touch();

        let Some(results) = data.get("result").and_then(serde_json::Value::as_array) else {
            continue;
        };
        for update in results {
            if let Some(uid) = update.get("update_id").and_then(serde_json::Value::as_i64) {
                inner.offset.store(uid + 1, Ordering::Relaxed);
            }
            let Some(message) = update.get("message") else {
                continue;
            };
            if message.get("from").is_none() || message.get("chat").is_none() {
                // Malformed update: drop it, count it, keep polling.
                inner.shared.record_malformed();
                continue;
            }
            let self_id = inner.self_id.lock().clone();
            if let Some(msg) = normalize_update(message, &inner.policy, self_id.as_deref()) {
                inner.queue.push(msg);
            }
        }
    }
}

/// Map one Bot API `message` object into the canonical model.
fn normalize_update(
    message: &serde_json::Value,
    policy: &InboundPolicy,
    self_id: Option<&str>,
) -> Option<InboundMessage> {
    let from = message.get("from")?;
    let user_id = from["id"].as_i64()?.to_string();
    let username = from["username"].as_str();

    if from["is_bot"].as_bool().unwrap_or(false) {
        return None;
    }
    if self_id.is_some_and(|own| own == user_id) {
        return None;
    }

    let mut identities: Vec<&str> = vec![user_id.as_str()];
    if let Some(name) = username {
        identities.push(name);
    }

    let chat = message.get("chat")?;
    let chat_id = chat["id"].as_i64()?.to_string();
    let is_group = chat["type"].as_str().unwrap_or("private") != "private";

    let mut msg = InboundMessage::text("telegram", user_id.clone(), chat_id, "");
    msg.is_group = is_group;
    msg.sender_name = username
        .map(String::from)
        .or_else(|| from["first_name"].as_str().map(String::from));
    if let Some(message_id) = message["message_id"].as_i64() {
        msg.id = message_id.to_string();
    }
    if let Some(ts) = message["date"].as_i64() {
        if let Some(parsed) = Utc.timestamp_opt(ts, 0).single() {
            msg.timestamp = parsed;
        }
    }
    if let Some(reply) = message.get("reply_to_message").filter(|r| !r.is_null()) {
        msg.reply_to = reply["message_id"].as_i64().map(|id| id.to_string());
        msg.quoted_text = reply["text"]
            .as_str()
            .or_else(|| reply["caption"].as_str())
            .map(String::from);
    }

    let caption = message["caption"].as_str().unwrap_or("").to_string();
    if let Some(text) = message["text"].as_str() {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        msg.content = text.to_string();
    } else if let Some(photos) = message["photo"].as_array() {
        // Telegram sends every thumbnail size; the last entry is the largest.
        let best = photos.last()?;
        msg.content_type = ContentType::Image;
        msg.content = caption;
        msg.media = Some(MediaRef {
            id: best["file_id"].as_str().map(String::from),
            size_bytes: best["file_size"].as_u64(),
            ..MediaRef::default()
        });
    } else if let Some(doc) = message.get("document") {
        msg.content_type = ContentType::Document;
        msg.content = caption;
        msg.media = Some(MediaRef {
            id: doc["file_id"].as_str().map(String::from),
            mime_type: doc["mime_type"].as_str().map(String::from),
            size_bytes: doc["file_size"].as_u64(),
            file_name: doc["file_name"].as_str().map(String::from),
            ..MediaRef::default()
        });
    } else if let Some(voice) = message.get("voice").or_else(|| message.get("audio")) {
        msg.content_type = ContentType::Audio;
        msg.content = caption;
        msg.media = Some(MediaRef {
            id: voice["file_id"].as_str().map(String::from),
            mime_type: voice["mime_type"].as_str().map(String::from),
            size_bytes: voice["file_size"].as_u64(),
            ..MediaRef::default()
        });
    } else if let Some(video) = message.get("video") {
        msg.content_type = ContentType::Video;
        msg.content = caption;
        msg.media = Some(MediaRef {
            id: video["file_id"].as_str().map(String::from),
            mime_type: video["mime_type"].as_str().map(String::from),
            size_bytes: video["file_size"].as_u64(),
            ..MediaRef::default()
        });
    } else if let Some(sticker) = message.get("sticker") {
        msg.content_type = ContentType::Sticker;
        msg.content = sticker["emoji"].as_str().unwrap_or("").to_string();
        msg.media = Some(MediaRef {
            id: sticker["file_id"].as_str().map(String::from),
            ..MediaRef::default()
        });
    } else if let Some(location) = message.get("location") {
        msg.content_type = ContentType::Location;
        msg.location = Some(Location {
            latitude: location["latitude"].as_f64().unwrap_or(0.0),
            longitude: location["longitude"].as_f64().unwrap_or(0.0),
            name: None,
        });
    } else if let Some(contact) = message.get("contact") {
        msg.content_type = ContentType::Contact;
        let name = contact["first_name"].as_str().unwrap_or("").to_string();
        msg.content = name.clone();
        msg.contact = Some(ContactCard {
            display_name: name,
            vcard: contact["vcard"].as_str().map(String::from),
        });
    } else {
        // Unrecognized payload kind: drop per-message, keep the loop alive.
        return None;
    }

    match policy.evaluate_with_identities(&msg, &identities, self_id) {
        Ok(()) => Some(msg),
        Err(reason) => {
            tracing::warn!(
                "telegram: ignoring message from unauthorized user: username={}, user_id={user_id} ({reason:?})",
                username.unwrap_or("unknown")
            );
            None
        }
    }
}

struct TelegramProbe(Arc<Inner>);

#[async_trait]
impl ConnectivityProbe for TelegramProbe {
    async fn transport_alive(&self) -> bool {
        // Long-polling has no socket to inspect; a cheap getMe is the
        // closest transport-level truth available.
        self.0.get_me().await.is_ok()
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let inner = &self.inner;
        if inner.shared.is_connected() {
            return Ok(());
        }
        inner.shared.state.transition(ConnectionState::Connecting)?;

        tokio::spawn(run_supervisor(Arc::clone(inner)));

        let trigger: Arc<dyn Fn(StaleReason) + Send + Sync> = {
            let inner = Arc::clone(inner);
            Arc::new(move |_reason| {
                if let Some(session) = inner.session_cancel.lock().as_ref() {
                    session.cancel();
                }
            })
        };
        spawn_watchdog(
            Arc::clone(&inner.shared),
            inner.cfg.health.clone(),
            Arc::new(TelegramProbe(Arc::clone(inner))),
            trigger,
        );
        let keepalive_inner = Arc::clone(inner);
        spawn_keepalive(
            Arc::clone(&inner.shared),
            inner.cfg.health.keepalive_interval(),
            move || {
                let inner = Arc::clone(&keepalive_inner);
                async move { inner.get_me().await.map(|_| ()) }
            },
        );
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
            tracing::debug!("telegram: outbound message was all reasoning, suppressed");
            return Ok(());
        };
        Self::validate_recipient(recipient)?;

        let mut body = serde_json::json!({
            "chat_id": recipient,
            "text": content,
            "parse_mode": "Markdown",
        });
        if let Some(reply_to) = &message.reply_to {
            if let Ok(id) = reply_to.parse::<i64>() {
                body["reply_to_message_id"] = serde_json::json!(id);
            }
        }
        self.call_api("sendMessage", body).await?;
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
            "poll_offset".into(),
            self.inner.offset.load(Ordering::Relaxed).to_string(),
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
impl MediaSupport for TelegramChannel {
    async fn send_media(
        &self,
        recipient: &str,
        media: &MediaMessage,
    ) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        Self::validate_recipient(recipient)?;
        let is_image = media.mime_type.starts_with("image/");
        let (method, field) = if is_image {
            ("sendPhoto", "photo")
        } else {
            ("sendDocument", "document")
        };

        match &media.source {
            MediaSource::Url(url) => {
                let mut body = serde_json::json!({ "chat_id": recipient, field: url });
                if let Some(caption) = &media.caption {
                    body["caption"] = serde_json::json!(caption);
                }
                self.call_api(method, body).await?;
            }
            MediaSource::Bytes(bytes) => {
                let file_name = media
                    .file_name
                    .clone()
                    .unwrap_or_else(|| "attachment".to_string());
                let part = reqwest::multipart::Part::bytes(bytes.clone())
                    .file_name(file_name)
                    .mime_str(&media.mime_type)
                    .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
                let mut form = reqwest::multipart::Form::new()
                    .text("chat_id", recipient.to_string())
                    .part(field, part);
                if let Some(caption) = &media.caption {
                    form = form.text("caption", caption.clone());
                }
                let resp = self
                    .inner
                    .http
                    .post(self.inner.api_url(method))
                    .multipart(form)
                    .send()
                    .await?;
                let data: serde_json::Value = resp.json().await?;
                if data["ok"].as_bool() != Some(true) {
                    return Err(ChannelError::SendFailed(format!(
                        "telegram {method} failed: {}",
                        data["description"].as_str().unwrap_or("unknown")
                    )));
                }
            }
        }
        self.inner.shared.touch();
        Ok(())
    }

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        let file_id = media
            .id
            .as_deref()
            .ok_or_else(|| ChannelError::Transport("media descriptor has no file id".into()))?;
        let result = self
            .call_api("getFile", serde_json::json!({ "file_id": file_id }))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let path = result["file_path"]
            .as_str()
            .ok_or_else(|| ChannelError::Transport("getFile returned no path".into()))?;
        let url = format!(
            "{}/file/bot{}/{path}",
            self.inner.api_base, self.inner.cfg.bot_token
        );
        let resp = self.inner.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(ChannelError::Transport(format!(
                "file download failed ({})",
                resp.status()
            )));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl PresenceSupport for TelegramChannel {
    async fn send_typing(&self, chat: &str, typing: bool) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        if !typing {
            // Chat actions expire on their own after a few seconds.
            return Ok(());
        }
        self.call_api(
            "sendChatAction",
            serde_json::json!({ "chat_id": chat, "action": "typing" }),
        )
        .await?;
        Ok(())
    }

    async fn send_presence(&self, _presence: Presence) -> Result<(), ChannelError> {
        Err(ChannelError::NotSupported("presence updates"))
    }

    async fn mark_read(&self, _chat: &str, _message_ids: &[String]) -> Result<(), ChannelError> {
        Err(ChannelError::NotSupported("read receipts"))
    }
}

#[async_trait]
impl ReactionSupport for TelegramChannel {
    async fn send_reaction(
        &self,
        chat: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        let message_id: i64 = message_id
            .parse()
            .map_err(|_| ChannelError::InvalidRecipient(message_id.to_string()))?;
        self.call_api(
            "setMessageReaction",
            serde_json::json!({
                "chat_id": chat,
                "message_id": message_id,
                "reaction": [{ "type": "emoji", "emoji": emoji }],
            }),
        )
        .await?;
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

    fn text_message(user_id: i64, username: Option<&str>, chat_type: &str) -> serde_json::Value {
        let mut from = serde_json::json!({ "id": user_id, "is_bot": false });
        if let Some(name) = username {
            from["username"] = serde_json::json!(name);
        }
        serde_json::json!({
            "message_id": 7,
            "date": 1_700_000_000,
            "from": from,
            "chat": { "id": -100123, "type": chat_type },
            "text": "hello",
        })
    }

    #[test]
    fn normalize_text_message() {
        let msg = normalize_update(
            &text_message(42, Some("alice"), "private"),
            &open_policy(),
            None,
        )
        .unwrap();
        assert_eq!(msg.sender, "42");
        assert_eq!(msg.sender_name.as_deref(), Some("alice"));
        assert_eq!(msg.chat, "-100123");
        assert_eq!(msg.id, "7");
        assert!(!msg.is_group);
        assert_eq!(msg.content, "hello");
    }

    #[test]
    fn group_chat_types_are_groups() {
        for chat_type in ["group", "supergroup", "channel"] {
            let msg = normalize_update(
                &text_message(42, None, chat_type),
                &open_policy(),
                None,
            )
            .unwrap();
            assert!(msg.is_group, "{chat_type} should be a group");
        }
    }

    #[test]
    fn allowlist_matches_username_or_numeric_id() {
        let by_name = InboundPolicy {
            allowed_senders: vec!["alice".into()],
            ..InboundPolicy::default()
        };
        let by_id = InboundPolicy {
            allowed_senders: vec!["42".into()],
            ..InboundPolicy::default()
        };
        let update = text_message(42, Some("alice"), "private");
        assert!(normalize_update(&update, &by_name, None).is_some());
        assert!(normalize_update(&update, &by_id, None).is_some());

        let stranger = text_message(99, Some("mallory"), "private");
        assert!(normalize_update(&stranger, &by_name, None).is_none());
    }

    #[test]
    fn bots_and_self_are_dropped() {
        let mut bot = text_message(42, Some("helper"), "private");
        bot["from"]["is_bot"] = serde_json::json!(true);
        assert!(normalize_update(&bot, &open_policy(), None).is_none());

        let own = text_message(42, None, "private");
        assert!(normalize_update(&own, &open_policy(), Some("42")).is_none());
    }

    #[test]
    fn photo_takes_largest_size() {
        let mut update = text_message(42, None, "private");
        update.as_object_mut().unwrap().remove("text");
        update["caption"] = serde_json::json!("look");
        update["photo"] = serde_json::json!([
            { "file_id": "small", "file_size": 100 },
            { "file_id": "large", "file_size": 9000 },
        ]);
        let msg = normalize_update(&update, &open_policy(), None).unwrap();
        assert_eq!(msg.content_type, ContentType::Image);
        assert_eq!(msg.content, "look");
        assert_eq!(msg.media.unwrap().id.as_deref(), Some("large"));
    }

    #[test]
    fn location_and_contact_payloads() {
        let mut update = text_message(42, None, "private");
        update.as_object_mut().unwrap().remove("text");
        update["location"] = serde_json::json!({ "latitude": 52.5, "longitude": 13.4 });
        let msg = normalize_update(&update, &open_policy(), None).unwrap();
        assert_eq!(msg.content_type, ContentType::Location);
        let loc = msg.location.unwrap();
        assert!((loc.latitude - 52.5).abs() < f64::EPSILON);

        let mut update = text_message(42, None, "private");
        update.as_object_mut().unwrap().remove("text");
        update["contact"] =
            serde_json::json!({ "first_name": "Bob", "phone_number": "+491234" });
        let msg = normalize_update(&update, &open_policy(), None).unwrap();
        assert_eq!(msg.content_type, ContentType::Contact);
        assert_eq!(msg.contact.unwrap().display_name, "Bob");
    }

    #[test]
    fn unrecognized_payload_is_dropped() {
        let mut update = text_message(42, None, "private");
        update.as_object_mut().unwrap().remove("text");
        update["poll"] = serde_json::json!({ "question": "?" });
        assert!(normalize_update(&update, &open_policy(), None).is_none());
    }

    #[test]
    fn reply_reference_is_carried() {
        let mut update = text_message(42, None, "private");
        update["reply_to_message"] =
            serde_json::json!({ "message_id": 5, "text": "the original" });
        let msg = normalize_update(&update, &open_policy(), None).unwrap();
        assert_eq!(msg.reply_to.as_deref(), Some("5"));
        assert_eq!(msg.quoted_text.as_deref(), Some("the original"));
    }

    #[test]
    fn group_policy_direct_only() {
        let policy = InboundPolicy {
            allowed_senders: vec!["*".into()],
            group_policy: GroupPolicy::DirectOnly,
            ..InboundPolicy::default()
        };
        assert!(normalize_update(&text_message(42, None, "group"), &policy, None).is_none());
        assert!(normalize_update(&text_message(42, None, "private"), &policy, None).is_some());
    }

    #[test]
    fn recipient_validation() {
        assert!(TelegramChannel::validate_recipient("12345").is_ok());
        assert!(TelegramChannel::validate_recipient("-100123").is_ok());
        assert!(TelegramChannel::validate_recipient("@mychannel").is_ok());
        assert!(TelegramChannel::validate_recipient("bogus").is_err());
        assert!(TelegramChannel::validate_recipient("@").is_err());
    }

    #[tokio::test]
    async fn send_while_disconnected_errors_without_io() {
        let cfg = TelegramConfig {
            bot_token: "123:ABC".into(),
            allowed_users: vec!["*".into()],
            blocked_users: vec![],
            allowed_chats: vec![],
            group_policy: GroupPolicy::All,
            queue_capacity: 8,
            reconnect: Default::default(),
            health: Default::default(),
        };
        let ch = TelegramChannel::new(cfg, &CancellationToken::new());
        let err = ch
            .send("12345", &OutboundMessage::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Disconnected));
    }
}
