//! Bounded cache of message ids the system itself sent.
//!
//! Used to scope reaction notifications: a reaction is only worth waking the
//! agent for when it targets one of our own messages. The cache is capped at
//! a hard size; when full, the oldest half is evicted in one sweep so steady
//! traffic amortizes to O(1) per insert and the set never grows unbounded.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

pub const DEFAULT_SENT_CACHE_CAP: usize = 512;

#[derive(Debug, Default)]
struct Inner {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

/// Insertion-ordered, hard-capped id set keyed by `chat:message_id`.
#[derive(Debug)]
pub struct SentMessageCache {
    cap: usize,
    inner: Mutex<Inner>,
}

impl SentMessageCache {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(2),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn key(chat: &str, message_id: &str) -> String {
        format!("{chat}:{message_id}")
    }

    /// Record a message we sent.
    pub fn insert(&self, chat: &str, message_id: &str) {
        let key = Self::key(chat, message_id);
        let mut inner = self.inner.lock();
        if !inner.keys.insert(key.clone()) {
            return; // already tracked; keep original position
        }
        inner.order.push_back(key);
        if inner.order.len() > self.cap {
            // Evict the oldest half in one sweep.
            let evict = inner.order.len() / 2;
            for _ in 0..evict {
                if let Some(old) = inner.order.pop_front() {
                    inner.keys.remove(&old);
                }
            }
        }
    }

    /// Whether the given message is one of ours.
    pub fn contains(&self, chat: &str, message_id: &str) -> bool {
        self.inner.lock().keys.contains(&Self::key(chat, message_id))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SentMessageCache {
    fn default() -> Self {
        Self::new(DEFAULT_SENT_CACHE_CAP)
    }
}
