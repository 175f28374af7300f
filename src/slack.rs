//! Slack channel — polls conversations.history via the Web API, sends with
//! chat.postMessage.
//!
//! The smallest lifecycle subset: auth.test is the connect confirmation and
//! the keepalive, and Slack's 200-with-`"ok": false` convention means every
//! response body gets inspected, not just the status line.

use crate::config::SlackConfig;
use crate::error::ChannelError;
use crate::health::{
    spawn_keepalive, spawn_watchdog, ConnectivityProbe, HealthSnapshot, StaleReason,
};
use crate::message::{InboundMessage, OutboundMessage};
use crate::policy::{strip_reasoning, InboundPolicy};
use crate::queue::DeliveryQueue;
use crate::reconnect::ReconnectPolicy;
use crate::runtime::ConnectionShared;
use crate::state::ConnectionState;
use crate::traits::{Channel, ReactionSupport};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

const DEFAULT_API_BASE: &str = "https://slack.com/api";
/// Consecutive poll failures before the adapter enters the reconnect path.
const MAX_POLL_ERRORS: u32 = 3;

struct Inner {
    cfg: SlackConfig,
    http: reqwest::Client,
    api_base: String,
    shared: Arc<ConnectionShared>,
    policy: InboundPolicy,
    queue: DeliveryQueue,
    /// Bot's own user id, learned from auth.test; used to skip our own
    /// messages in the history poll.
    self_id: Mutex<Option<String>>,
    /// Timestamp of the newest message already processed.
    last_ts: Mutex<String>,
    reconnect_policy: ReconnectPolicy,
    session_cancel: Mutex<Option<CancellationToken>>,
}

impl Inner {
    async fn auth_test(&self) -> Result<String, ChannelError> {
        let resp = self
            .http
            .get(format!("{}/auth.test", self.api_base))
            .bearer_auth(&self.cfg.bot_token)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        let data: serde_json::Value = resp.json().await?;
        if data["ok"].as_bool() != Some(true) {
            return Err(ChannelError::Transport(format!(
                "auth.test rejected: {}",
                data["error"].as_str().unwrap_or("unknown")
            )));
        }
        data["user_id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ChannelError::Transport("auth.test returned no user_id".into()))
    }
}

/// Slack adapter.
pub struct SlackChannel {
    inner: Arc<Inner>,
}

impl SlackChannel {
    pub fn new(cfg: SlackConfig, parent: &CancellationToken) -> Self {
        let policy = InboundPolicy {
            allowed_senders: cfg.allowed_users.clone(),
            blocked_senders: cfg.blocked_users.clone(),
            allowed_chats: Vec::new(),
            group_policy: Default::default(),
        };
        let inner = Inner {
            http: reqwest::Client::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            shared: Arc::new(ConnectionShared::new("slack", parent)),
            policy,
            queue: DeliveryQueue::new("slack", cfg.queue_capacity),
            self_id: Mutex::new(None),
            last_ts: Mutex::new(String::new()),
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

    /// Slack web API returns 200 for most app-level errors; the JSON `ok`
    /// field is the real verdict.
    async fn check_api_response(
        resp: reqwest::Response,
        what: &str,
    ) -> Result<serde_json::Value, ChannelError> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
        if !status.is_success() {
            return Err(ChannelError::SendFailed(format!(
                "slack {what} failed ({status}): {body}"
            )));
        }
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
        if parsed["ok"].as_bool() != Some(true) {
            let err = parsed["error"].as_str().unwrap_or("unknown");
            return Err(ChannelError::SendFailed(format!(
                "slack {what} failed: {err}"
            )));
        }
        Ok(parsed)
    }
}

async fn run_supervisor(inner: Arc<Inner>) {
    let cancel = inner.shared.cancel_token().clone();
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match inner.auth_test().await {
            Ok(user_id) => {
                tracing::info!("slack: connected as {user_id}");
                *inner.self_id.lock() = Some(user_id);
                inner.shared.mark_connected();
                inner
                    .shared
                    .state
                    .transition_if_legal(ConnectionState::Connected);
            }
            Err(e) => {
                inner.shared.record_error();
                tracing::warn!("slack: connect check failed: {e}");
                if !backoff_or_give_up(&inner).await {
                    return;
                }
                continue;
            }
        }

        match run_poll_loop(&inner).await {
            PollEnd::Shutdown => return,
            PollEnd::Lost(reason) => {
                tracing::warn!("slack: poll loop lost: {reason}");
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

async fn backoff_or_give_up(inner: &Arc<Inner>) -> bool {
    let Some((attempt, delay)) =
        crate::reconnect::next_backoff(&inner.shared, &inner.reconnect_policy)
    else {
        tracing::error!(
            "slack: giving up after {} reconnect attempts",
            inner.shared.attempts()
        );
        inner
            .shared
            .state
            .transition_if_legal(ConnectionState::Disconnected);
        return false;
    };
    tracing::info!("slack: reconnect attempt {attempt} in {}s", delay.as_secs());
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

    let Some(channel_id) = inner.cfg.channel_id.clone() else {
        tracing::warn!("slack: no channel_id configured, send-only mode");
        // Nothing to poll; hold until shutdown so the lifecycle stays Connected.
        tokio::select! {
            _ = parent.cancelled() => return PollEnd::Shutdown,
            _ = session.cancelled() => return PollEnd::Lost("session teardown forced".into()),
        }
    };
    let poll_interval = Duration::from_secs(inner.cfg.poll_interval_secs.max(1));

    loop {
        tokio::select! {
            _ = parent.cancelled() => return PollEnd::Shutdown,
            _ = session.cancelled() => return PollEnd::Lost("session teardown forced".into()),
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let mut params = vec![
            ("channel", channel_id.clone()),
            ("limit", "10".to_string()),
        ];
        {
            let last_ts = inner.last_ts.lock();
            if !last_ts.is_empty() {
                params.push(("oldest", last_ts.clone()));
            }
        }

        let resp = inner
            .http
            .get(format!("{}/conversations.history", inner.api_base))
            .bearer_auth(&inner.cfg.bot_token)
            .query(&params)
            .send()
            .await;

        let data: serde_json::Value = match resp {
            Ok(r) => match r.json().await {
                Ok(d) => d,
                Err(e) => {
                    if inner.shared.record_error() >= MAX_POLL_ERRORS {
                        return PollEnd::Lost(format!("parse error: {e}"));
                    }
                    tracing::warn!("slack: parse error: {e}");
                    continue;
                }
            },
            Err(e) => {
                if inner.shared.record_error() >= MAX_POLL_ERRORS {
                    return PollEnd::Lost(format!("poll error: {e}"));
                }
                tracing::warn!("slack: poll error: {e}");
                continue;
            }
        };

        if data["ok"].as_bool() != Some(true) {
            let err = data["error"].as_str().unwrap_or("unknown");
            if inner.shared.record_error() >= MAX_POLL_ERRORS {
                return PollEnd::Lost(format!("history error: {err}"));
            }
            tracing::warn!("slack: history error: {err}");
            continue;
        }

        inner.shared.clear_errors();
        inner.shared.touch();

        let Some(messages) = data["messages"].as_array() else {
            continue;
        };
        let self_id = inner.self_id.lock().clone();
        // Messages come newest-first; reverse to process oldest first.
        for raw in messages.iter().rev() {
            let ts = raw["ts"].as_str().unwrap_or("");
            {
                let mut last_ts = inner.last_ts.lock();
                if ts.is_empty() || ts <= last_ts.as_str() {
                    continue;
                }
                *last_ts = ts.to_string();
            }
            if let Some(msg) =
                normalize_history_message(raw, &channel_id, &inner.policy, self_id.as_deref())
            {
                inner.queue.push(msg);
            }
        }
    }
}

/// Map one conversations.history entry into the canonical model.
fn normalize_history_message(
    raw: &serde_json::Value,
    channel_id: &str,
    policy: &InboundPolicy,
    self_id: Option<&str>,
) -> Option<InboundMessage> {
    // Joins, topic changes etc. carry a subtype; only plain user messages
    // become agent input.
    if raw.get("subtype").is_some() {
        return None;
    }
    let user = raw["user"].as_str()?;
    let text = raw["text"].as_str().unwrap_or("").trim();
    if text.is_empty() {
        return None;
    }
    let ts = raw["ts"].as_str().unwrap_or("");

    let mut msg = InboundMessage::text("slack", user, channel_id, text);
    // Deterministic id so a restart can't double-deliver the same history.
    msg.id = format!("slack_{channel_id}_{ts}");
    if let Some(secs) = ts.split('.').next().and_then(|s| s.parse::<i64>().ok()) {
        if let Some(parsed) = Utc.timestamp_opt(secs, 0).single() {
            msg.timestamp = parsed;
        }
    }
    if let Some(thread_ts) = raw["thread_ts"].as_str() {
        if thread_ts != ts {
            msg.reply_to = Some(thread_ts.to_string());
        }
        msg.metadata.insert(
            "thread_ts".into(),
            serde_json::Value::String(thread_ts.to_string()),
        );
    }

    match policy.evaluate(&msg, self_id) {
        Ok(()) => Some(msg),
        Err(reason) => {
            tracing::warn!("slack: ignoring message from {user}: {reason:?}");
            None
        }
    }
}

struct SlackProbe(Arc<Inner>);

#[async_trait]
impl ConnectivityProbe for SlackProbe {
    async fn transport_alive(&self) -> bool {
        self.0.auth_test().await.is_ok()
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
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
            Arc::new(SlackProbe(Arc::clone(inner))),
            trigger,
        );
        let keepalive_inner = Arc::clone(inner);
        spawn_keepalive(
            Arc::clone(&inner.shared),
            inner.cfg.health.keepalive_interval(),
            move || {
                let inner = Arc::clone(&keepalive_inner);
                async move { inner.auth_test().await.map(|_| ()) }
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
            tracing::debug!("slack: outbound message was all reasoning, suppressed");
            return Ok(());
        };
        if recipient.trim().is_empty() {
            return Err(ChannelError::InvalidRecipient(recipient.to_string()));
        }

        let mut body = serde_json::json!({
            "channel": recipient,
            "text": content,
        });
        if let Some(reply_to) = &message.reply_to {
            body["thread_ts"] = serde_json::json!(reply_to);
        }
        let resp = self
            .inner
            .http
            .post(format!("{}/chat.postMessage", self.inner.api_base))
            .bearer_auth(&self.inner.cfg.bot_token)
            .json(&body)
            .send()
            .await?;
        Self::check_api_response(resp, "chat.postMessage").await?;
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
            "poll_channel".into(),
            self.inner.cfg.channel_id.clone().unwrap_or_default(),
        );
        HealthSnapshot::of(&self.inner.shared, detail)
    }

    fn reactions(&self) -> Option<&dyn ReactionSupport> {
        Some(self)
    }
}

#[async_trait]
impl ReactionSupport for SlackChannel {
    async fn send_reaction(
        &self,
        chat: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ChannelError> {
        crate::runtime::require_connected(&self.inner.shared)?;
        // Slack takes the raw ts as the message handle and emoji names
        // without colons.
        let name = emoji.trim_matches(':');
        let resp = self
            .inner
            .http
            .post(format!("{}/reactions.add", self.inner.api_base))
            .bearer_auth(&self.inner.cfg.bot_token)
            .json(&serde_json::json!({
                "channel": chat,
                "timestamp": message_id,
                "name": name,
            }))
            .send()
            .await?;
        Self::check_api_response(resp, "reactions.add").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_policy() -> InboundPolicy {
        InboundPolicy {
            allowed_senders: vec!["*".into()],
            ..InboundPolicy::default()
        }
    }

    fn history_entry(user: &str, text: &str, ts: &str) -> serde_json::Value {
        serde_json::json!({ "user": user, "text": text, "ts": ts })
    }

    #[test]
    fn normalize_plain_message() {
        let msg = normalize_history_message(
            &history_entry("U123", "ping", "1700000000.000100"),
            "C456",
            &open_policy(),
            None,
        )
        .unwrap();
        assert_eq!(msg.sender, "U123");
        assert_eq!(msg.chat, "C456");
        assert_eq!(msg.content, "ping");
        assert_eq!(msg.id, "slack_C456_1700000000.000100");
    }

    #[test]
    fn message_id_is_deterministic() {
        let a = normalize_history_message(
            &history_entry("U1", "x", "1.2"),
            "C1",
            &open_policy(),
            None,
        )
        .unwrap();
        let b = normalize_history_message(
            &history_entry("U1", "x", "1.2"),
            "C1",
            &open_policy(),
            None,
        )
        .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn subtyped_messages_are_dropped() {
        let mut raw = history_entry("U123", "joined", "1.0");
        raw["subtype"] = serde_json::json!("channel_join");
        assert!(normalize_history_message(&raw, "C1", &open_policy(), None).is_none());
    }

    #[test]
    fn own_messages_are_dropped() {
        let raw = history_entry("UBOT", "echo", "1.0");
        assert!(normalize_history_message(&raw, "C1", &open_policy(), Some("UBOT")).is_none());
    }

    #[test]
    fn empty_text_is_dropped() {
        let raw = history_entry("U123", "   ", "1.0");
        assert!(normalize_history_message(&raw, "C1", &open_policy(), None).is_none());
    }

    #[test]
    fn allowlist_filters_users() {
        let policy = InboundPolicy {
            allowed_senders: vec!["U111".into()],
            ..InboundPolicy::default()
        };
        assert!(normalize_history_message(
            &history_entry("U111", "hi", "1.0"),
            "C1",
            &policy,
            None
        )
        .is_some());
        assert!(normalize_history_message(
            &history_entry("U222", "hi", "1.0"),
            "C1",
            &policy,
            None
        )
        .is_none());
    }

    #[test]
    fn thread_reply_carries_thread_ts() {
        let mut raw = history_entry("U123", "reply", "2.0");
        raw["thread_ts"] = serde_json::json!("1.0");
        let msg = normalize_history_message(&raw, "C1", &open_policy(), None).unwrap();
        assert_eq!(msg.reply_to.as_deref(), Some("1.0"));
        assert_eq!(msg.metadata["thread_ts"], "1.0");
    }

    #[test]
    fn thread_root_is_not_a_reply() {
        let mut raw = history_entry("U123", "root", "1.0");
        raw["thread_ts"] = serde_json::json!("1.0");
        let msg = normalize_history_message(&raw, "C1", &open_policy(), None).unwrap();
        assert!(msg.reply_to.is_none());
    }

    #[tokio::test]
    async fn send_while_disconnected_errors_without_io() {
        let cfg = SlackConfig {
            bot_token: "xoxb-fake".into(),
            channel_id: Some("C1".into()),
            allowed_users: vec!["*".into()],
            blocked_users: vec![],
            queue_capacity: 8,
            poll_interval_secs: 3,
            reconnect: Default::default(),
            health: Default::default(),
        };
        let ch = SlackChannel::new(cfg, &CancellationToken::new());
        let err = ch
            .send("C1", &OutboundMessage::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Disconnected));
    }
}
