//! Inbound filtering and outbound suppression policy.
//!
//! Every adapter applies the same checks, in the same order, before a
//! normalized message reaches the delivery queue: self-message suppression,
//! blocklist, sender allowlist, chat allowlist, group-vs-DM policy. The
//! allowlist convention follows the rest of the system: `"*"` allows
//! everyone, an empty list denies everyone until explicitly configured.

use crate::config::GroupPolicy;
use crate::message::InboundMessage;

/// Why an inbound message was dropped instead of delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SelfMessage,
    BlockedSender,
    SenderNotAllowed,
    ChatNotAllowed,
    GroupPolicy,
}

/// Per-adapter inbound filtering rules, built from the adapter's config at
/// construction.
#[derive(Debug, Clone, Default)]
pub struct InboundPolicy {
    /// Sender ids allowed to interact; `"*"` = everyone, empty = no one.
    pub allowed_senders: Vec<String>,
    /// Sender ids always dropped, checked before the allowlist.
    pub blocked_senders: Vec<String>,
    /// Chats the adapter listens to; empty = no chat restriction.
    pub allowed_chats: Vec<String>,
    pub group_policy: GroupPolicy,
}

impl InboundPolicy {
    /// A sender id (or any of its alternate identities: username and numeric
    /// id on Telegram, phone and JID on WhatsApp) passes the allowlist when
    /// any identity matches.
    pub fn sender_allowed<'a, I>(&self, identities: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let ids: Vec<&str> = identities.into_iter().collect();
        if ids
            .iter()
            .any(|id| self.blocked_senders.iter().any(|b| b == id))
        {
            return false;
        }
        ids.iter()
            .any(|id| self.allowed_senders.iter().any(|a| a == "*" || a == id))
    }

    pub fn chat_allowed(&self, chat: &str) -> bool {
        self.allowed_chats.is_empty() || self.allowed_chats.iter().any(|c| c == chat)
    }

    /// A chat passes when any of its identities does (e.g. Discord channel id
    /// or its enclosing guild id).
    pub fn chat_allowed_any<'a, I>(&self, chats: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.allowed_chats.is_empty()
            || chats
                .into_iter()
                .any(|chat| self.allowed_chats.iter().any(|c| c == chat))
    }

    pub fn group_allowed(&self, is_group: bool) -> bool {
        match self.group_policy {
            GroupPolicy::All => true,
            GroupPolicy::DirectOnly => !is_group,
            GroupPolicy::GroupOnly => is_group,
        }
    }

    /// Run the full filter chain. `self_id` is the platform identity of this
    /// bot, used for self-message suppression.
    pub fn evaluate(&self, msg: &InboundMessage, self_id: Option<&str>) -> Result<(), DropReason> {
        self.evaluate_with_identities(msg, &[msg.sender.as_str()], self_id)
    }

    /// Like [`evaluate`](Self::evaluate) but with extra sender identities for
    /// platforms where the allowlist may name either form (Telegram username
    /// vs numeric id).
    pub fn evaluate_with_identities(
        &self,
        msg: &InboundMessage,
        identities: &[&str],
        self_id: Option<&str>,
    ) -> Result<(), DropReason> {
        if let Some(own) = self_id {
            if !own.is_empty() && identities.iter().any(|id| *id == own) {
                return Err(DropReason::SelfMessage);
            }
        }
        if identities
            .iter()
            .any(|id| self.blocked_senders.iter().any(|b| b == id))
        {
            return Err(DropReason::BlockedSender);
        }
        if !identities
            .iter()
            .any(|id| self.allowed_senders.iter().any(|a| a == "*" || a == id))
        {
            return Err(DropReason::SenderNotAllowed);
        }
        if !self.chat_allowed(&msg.chat) {
            return Err(DropReason::ChatNotAllowed);
        }
        if !self.group_allowed(msg.is_group) {
            return Err(DropReason::GroupPolicy);
        }
        Ok(())
    }
}

/// Strip internal reasoning segments from outbound text so they never reach
/// a platform send call.
///
/// Removes `<think>…</think>` / `<thinking>…</thinking>` blocks (including
/// unterminated ones) and a leading `Reasoning:` preamble separated from the
/// reply by a blank line. Returns `None` when nothing is left to send.
pub fn strip_reasoning(content: &str) -> Option<String> {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    loop {
        let open = match (rest.find("<think>"), rest.find("<thinking>")) {
            (Some(a), Some(b)) => Some(if a < b {
                (a, "<think>", "</think>")
            } else {
                (b, "<thinking>", "</thinking>")
            }),
            (Some(a), None) => Some((a, "<think>", "</think>")),
            (None, Some(b)) => Some((b, "<thinking>", "</thinking>")),
            (None, None) => None,
        };
        match open {
            Some((at, open_tag, close_tag)) => {
                out.push_str(&rest[..at]);
                let after_open = &rest[at + open_tag.len()..];
                match after_open.find(close_tag) {
                    Some(close) => rest = &after_open[close + close_tag.len()..],
                    // Unterminated block: everything after the tag is
                    // reasoning; drop it.
                    None => {
                        rest = "";
                    }
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }

    let trimmed = out.trim();
    let without_preamble = if let Some(after) = trimmed.strip_prefix("Reasoning:") {
        match after.find("\n\n") {
            Some(split) => after[split..].trim(),
            None => "",
        }
    } else {
        trimmed
    };

    if without_preamble.is_empty() {
        None
    } else {
        Some(without_preamble.to_string())
    }
}
