//! Bounded, non-blocking delivery queue between an adapter and the agent
//! pipeline.
//!
//! The adapter's receive loop must never block on delivery: stalling the
//! platform read path risks cascading disconnects. On saturation the newest
//! message is dropped and counted; that is the designed backpressure policy,
//! not an error.

use crate::message::InboundMessage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Fixed-capacity queue of normalized inbound messages.
#[derive(Debug)]
pub struct DeliveryQueue {
    channel: &'static str,
    tx: mpsc::Sender<InboundMessage>,
    rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

impl DeliveryQueue {
    pub fn new(channel: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            channel,
            tx,
            rx: Mutex::new(Some(rx)),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. Returns whether the message was accepted.
    ///
    /// A full queue drops the message with a warning; a closed queue (the
    /// consumer went away or `close` was called) drops silently at debug
    /// level since that is an orderly shutdown, not data loss worth alarming
    /// about.
    pub fn push(&self, msg: InboundMessage) -> bool {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(
                "{}: delivery queue closed, dropping message {}",
                self.channel,
                msg.id
            );
            return false;
        }
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "{}: delivery queue full ({}), dropping message {} from {}",
                    self.channel,
                    self.capacity,
                    msg.id,
                    msg.sender
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                tracing::debug!(
                    "{}: delivery queue closed, dropping message {}",
                    self.channel,
                    msg.id
                );
                false
            }
        }
    }

    /// Hand out the consumer side exactly once. The stream is infinite until
    /// the queue is closed and is not restartable afterwards.
    pub fn take_stream(&self) -> Option<ReceiverStream<InboundMessage>> {
        self.rx.lock().take().map(ReceiverStream::new)
    }

    /// Stop accepting messages. Idempotent; safe to call from overlapping
    /// teardown paths.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Also drop an unclaimed receiver so a consumer that never attached
        // does not pin buffered messages.
        self.rx.lock().take();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}
