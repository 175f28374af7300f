//! Typed configuration for channel adapters and their lifecycle machinery.
//!
//! The host process owns config file loading; this crate only defines the
//! shapes and their defaults. Every adapter takes its config struct at
//! construction together with its collaborators; there are no process-wide
//! registries to reach into.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection backoff settings shared by all adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Base delay in seconds; attempt N waits `min(base × N, cap)`.
    #[serde(default = "default_reconnect_base_secs")]
    pub base_secs: u64,
    /// Upper bound on the delay between attempts.
    #[serde(default = "default_reconnect_cap_secs")]
    pub cap_secs: u64,
    /// Attempts before the adapter gives up and goes terminal Disconnected.
    /// `0` means retry forever, an explicit operator opt-in, never what you
    /// get by leaving this unset.
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,
}

fn default_reconnect_base_secs() -> u64 {
    2
}

fn default_reconnect_cap_secs() -> u64 {
    60
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_secs: default_reconnect_base_secs(),
            cap_secs: default_reconnect_cap_secs(),
            max_attempts: default_reconnect_max_attempts(),
        }
    }
}

/// Health watchdog and keepalive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How often the watchdog wakes up.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Idle duration that triggers a low-level connectivity cross-check.
    #[serde(default = "default_soft_idle_secs")]
    pub soft_idle_secs: u64,
    /// Idle duration that forces reconnection regardless of what the
    /// transport claims. Recovers half-open sockets.
    #[serde(default = "default_hard_idle_secs")]
    pub hard_idle_secs: u64,
    /// Interval of the cheap keepalive presence update.
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_soft_idle_secs() -> u64 {
    300
}

fn default_hard_idle_secs() -> u64 {
    900
}

fn default_keepalive_interval_secs() -> u64 {
    300
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            soft_idle_secs: default_soft_idle_secs(),
            hard_idle_secs: default_hard_idle_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn soft_idle(&self) -> Duration {
        Duration::from_secs(self.soft_idle_secs)
    }

    pub fn hard_idle(&self) -> Duration {
        Duration::from_secs(self.hard_idle_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Pairing flow settings for adapters that link via a scanned one-time code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// How long a published pairing code stays scannable.
    #[serde(default = "default_code_ttl_secs")]
    pub code_ttl_secs: u64,
    /// Bound on an explicit refresh when the caller supplies no timeout.
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,
}

fn default_code_ttl_secs() -> u64 {
    60
}

fn default_refresh_timeout_secs() -> u64 {
    120
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_ttl_secs: default_code_ttl_secs(),
            refresh_timeout_secs: default_refresh_timeout_secs(),
        }
    }
}

/// Which chats an adapter forwards into the agent pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPolicy {
    /// Direct messages and groups alike.
    #[default]
    All,
    /// Direct messages only; group traffic is dropped.
    DirectOnly,
    /// Group traffic only; direct messages are dropped.
    GroupOnly,
}

fn default_queue_capacity() -> usize {
    256
}

/// WhatsApp adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// Phone numbers (E.164) allowed to interact, or `"*"` for all.
    /// Empty means deny everyone until configured.
    #[serde(default)]
    pub allowed_numbers: Vec<String>,
    /// Explicitly blocked numbers; checked before the allowlist.
    #[serde(default)]
    pub blocked_numbers: Vec<String>,
    /// Chat JIDs the adapter listens to. Empty means no chat restriction.
    #[serde(default)]
    pub allowed_chats: Vec<String>,
    #[serde(default)]
    pub group_policy: GroupPolicy,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            allowed_numbers: Vec::new(),
            blocked_numbers: Vec::new(),
            allowed_chats: Vec::new(),
            group_policy: GroupPolicy::default(),
            queue_capacity: default_queue_capacity(),
            reconnect: ReconnectConfig::default(),
            health: HealthConfig::default(),
            pairing: PairingConfig::default(),
        }
    }
}

/// Discord adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub bot_token: String,
    /// User ids allowed to interact, or `"*"` for all. Empty denies everyone.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub blocked_users: Vec<String>,
    /// Guild/channel ids the adapter listens to. Empty means no restriction.
    #[serde(default)]
    pub allowed_channels: Vec<String>,
    #[serde(default)]
    pub group_policy: GroupPolicy,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// Seconds an interactive component registration stays clickable.
    #[serde(default = "default_interaction_ttl_secs")]
    pub interaction_ttl_secs: u64,
}

fn default_interaction_ttl_secs() -> u64 {
    900
}

/// Telegram adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Usernames or numeric user ids allowed to interact, or `"*"`.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub blocked_users: Vec<String>,
    #[serde(default)]
    pub allowed_chats: Vec<String>,
    #[serde(default)]
    pub group_policy: GroupPolicy,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Slack adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    pub bot_token: String,
    /// Channel to poll for messages. Required for listening.
    pub channel_id: Option<String>,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub blocked_users: Vec<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_slack_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

fn default_slack_poll_interval_secs() -> u64 {
    3
}
