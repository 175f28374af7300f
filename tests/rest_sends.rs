//! Telegram and Slack REST paths exercised against a mock HTTP server.

use emberclaw_channels::config::{SlackConfig, TelegramConfig};
use emberclaw_channels::error::ChannelError;
use emberclaw_channels::message::OutboundMessage;
use emberclaw_channels::slack::SlackChannel;
use emberclaw_channels::telegram::TelegramChannel;
use emberclaw_channels::traits::Channel;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn wait_connected(channel: &dyn Channel) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !channel.is_connected() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("channel should connect against the mock server");
}

fn telegram_config() -> TelegramConfig {
    TelegramConfig {
        bot_token: "123:ABC".into(),
        allowed_users: vec!["*".into()],
        blocked_users: vec![],
        allowed_chats: vec![],
        group_policy: Default::default(),
        queue_capacity: 16,
        reconnect: Default::default(),
        health: Default::default(),
    }
}

fn slack_config() -> SlackConfig {
    SlackConfig {
        bot_token: "xoxb-fake".into(),
        channel_id: Some("C123".into()),
        allowed_users: vec!["*".into()],
        blocked_users: vec![],
        queue_capacity: 16,
        poll_interval_secs: 1,
        reconnect: Default::default(),
        health: Default::default(),
    }
}

/// Shared Telegram scaffolding: getMe succeeds, getUpdates idles.
async fn telegram_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bot123:ABC/getMe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "result": { "id": 99, "is_bot": true, "username": "emberbot" },
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bot123:ABC/getUpdates"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "ok": true, "result": [] }))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn telegram_send_posts_message() {
    let server = telegram_server().await;
    Mock::given(method("POST"))
        .and(path("/bot123:ABC/sendMessage"))
        .and(body_partial_json(serde_json::json!({
            "chat_id": "555",
            "text": "hello from the agent",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "result": { "message_id": 7 },
        })))
        .expect(1)
        .mount(&server)
        .await;

    let channel = TelegramChannel::new(telegram_config(), &CancellationToken::new())
        .with_api_base(server.uri());
    channel.connect().await.unwrap();
    wait_connected(&channel).await;

    channel
        .send("555", &OutboundMessage::new("hello from the agent"))
        .await
        .unwrap();
}

#[tokio::test]
async fn telegram_send_strips_reasoning_blocks() {
    let server = telegram_server().await;
    Mock::given(method("POST"))
        .and(path("/bot123:ABC/sendMessage"))
        .and(body_partial_json(serde_json::json!({
            "text": "the actual reply",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "result": { "message_id": 8 },
        })))
        .expect(1)
        .mount(&server)
        .await;

    let channel = TelegramChannel::new(telegram_config(), &CancellationToken::new())
        .with_api_base(server.uri());
    channel.connect().await.unwrap();
    wait_connected(&channel).await;

    channel
        .send(
            "555",
            &OutboundMessage::new("<think>should I say hi?</think>the actual reply"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn telegram_api_rejection_is_a_send_error() {
    let server = telegram_server().await;
    Mock::given(method("POST"))
        .and(path("/bot123:ABC/sendMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": false,
            "description": "Bad Request: chat not found",
        })))
        .mount(&server)
        .await;

    let channel = TelegramChannel::new(telegram_config(), &CancellationToken::new())
        .with_api_base(server.uri());
    channel.connect().await.unwrap();
    wait_connected(&channel).await;

    let err = channel
        .send("555", &OutboundMessage::new("hi"))
        .await
        .unwrap_err();
    match err {
        ChannelError::SendFailed(msg) => assert!(msg.contains("chat not found")),
        other => panic!("expected SendFailed, got {other}"),
    }
}

#[tokio::test]
async fn telegram_invalid_recipient_never_hits_the_wire() {
    let server = telegram_server().await;
    let channel = TelegramChannel::new(telegram_config(), &CancellationToken::new())
        .with_api_base(server.uri());
    channel.connect().await.unwrap();
    wait_connected(&channel).await;

    let err = channel
        .send("not a chat id", &OutboundMessage::new("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::InvalidRecipient(_)));
}

#[tokio::test]
async fn telegram_polled_update_reaches_inbound_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bot123:ABC/getMe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "result": { "id": 99 },
        })))
        .mount(&server)
        .await;
    // First poll returns one update, every later poll idles empty.
    Mock::given(method("POST"))
        .and(path("/bot123:ABC/getUpdates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "result": [{
                "update_id": 1000,
                "message": {
                    "message_id": 41,
                    "date": 1_700_000_000,
                    "from": { "id": 7, "is_bot": false, "username": "alice" },
                    "chat": { "id": 7, "type": "private" },
                    "text": "ping",
                },
            }],
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bot123:ABC/getUpdates"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "ok": true, "result": [] }))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let channel = TelegramChannel::new(telegram_config(), &CancellationToken::new())
        .with_api_base(server.uri());
    let mut inbound = channel.inbound().expect("inbound stream");
    channel.connect().await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(10), inbound.next())
        .await
        .expect("update delivered")
        .unwrap();
    assert_eq!(msg.channel, "telegram");
    assert_eq!(msg.sender, "7");
    assert_eq!(msg.content, "ping");
    assert_eq!(msg.id, "41");
}

/// Shared Slack scaffolding: auth.test succeeds, history idles.
async fn slack_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth.test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "user_id": "UBOT",
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/conversations.history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "messages": [],
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn slack_send_posts_message() {
    let server = slack_server().await;
    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .and(body_partial_json(serde_json::json!({
            "channel": "C123",
            "text": "standup in five",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "ts": "1700000000.000100",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let channel =
        SlackChannel::new(slack_config(), &CancellationToken::new()).with_api_base(server.uri());
    channel.connect().await.unwrap();
    wait_connected(&channel).await;

    channel
        .send("C123", &OutboundMessage::new("standup in five"))
        .await
        .unwrap();
}

#[tokio::test]
async fn slack_app_level_error_is_a_send_error() {
    let server = slack_server().await;
    // Slack's convention: HTTP 200 with ok=false.
    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": false,
            "error": "channel_not_found",
        })))
        .mount(&server)
        .await;

    let channel =
        SlackChannel::new(slack_config(), &CancellationToken::new()).with_api_base(server.uri());
    channel.connect().await.unwrap();
    wait_connected(&channel).await;

    let err = channel
        .send("CBAD", &OutboundMessage::new("hi"))
        .await
        .unwrap_err();
    match err {
        ChannelError::SendFailed(msg) => assert!(msg.contains("channel_not_found")),
        other => panic!("expected SendFailed, got {other}"),
    }
}

#[tokio::test]
async fn slack_history_poll_reaches_inbound_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth.test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "user_id": "UBOT",
        })))
        .mount(&server)
        .await;
    // One poll with a user message and one of our own; later polls empty.
    Mock::given(method("GET"))
        .and(path("/conversations.history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "messages": [
                { "user": "U777", "text": "how's the build?", "ts": "1700000001.000200" },
                { "user": "UBOT", "text": "echo from us", "ts": "1700000000.000100" },
            ],
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/conversations.history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "messages": [],
        })))
        .mount(&server)
        .await;

    let channel =
        SlackChannel::new(slack_config(), &CancellationToken::new()).with_api_base(server.uri());
    let mut inbound = channel.inbound().expect("inbound stream");
    channel.connect().await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(10), inbound.next())
        .await
        .expect("history message delivered")
        .unwrap();
    // Our own message was suppressed; only the user's got through.
    assert_eq!(msg.sender, "U777");
    assert_eq!(msg.content, "how's the build?");

    let nothing_else =
        tokio::time::timeout(Duration::from_millis(1500), inbound.next()).await;
    assert!(nothing_else.is_err(), "own message must not be delivered");
}

#[tokio::test]
async fn slack_reaction_send_uses_reactions_add() {
    let server = slack_server().await;
    Mock::given(method("POST"))
        .and(path("/reactions.add"))
        .and(body_partial_json(serde_json::json!({
            "channel": "C123",
            "timestamp": "1700000000.000100",
            "name": "shipit",
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let channel =
        SlackChannel::new(slack_config(), &CancellationToken::new()).with_api_base(server.uri());
    channel.connect().await.unwrap();
    wait_connected(&channel).await;

    let reactions = channel.reactions().expect("reaction capability");
    reactions
        .send_reaction("C123", "1700000000.000100", ":shipit:")
        .await
        .unwrap();
}
