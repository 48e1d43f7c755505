//! Queue messages: in-memory delivery state over persisted records.

use chronolog_core::{RecordMeta, Rowid};
use serde_json::Value;
use std::time::{Duration, Instant};

/// One message in the queue's active list.
///
/// A message is a thin wrapper over a stored record: a copy of its metadata
/// plus delivery bookkeeping that lives only in memory. The persisted
/// pending bit on the record is what survives a restart; soft marks, ack
/// timers and retry counters are reconstructed empty on recovery.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub(crate) rowid: Rowid,
    pub(crate) key: String,
    pub(crate) meta: RecordMeta,
    pub(crate) soft_mark: u64,
    pub(crate) retries: u32,
    pub(crate) ack_deadline: Option<Instant>,
    pub(crate) payload: Option<Value>,
}

impl QueueMessage {
    pub(crate) fn new(rowid: Rowid, key: String, meta: RecordMeta) -> Self {
        Self {
            rowid,
            key,
            meta,
            soft_mark: 0,
            retries: 0,
            ack_deadline: None,
            payload: None,
        }
    }

    /// The message's rowid in the underlying topic.
    #[must_use]
    pub fn rowid(&self) -> Rowid {
        self.rowid
    }

    /// The record's key stream.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// A copy of the record's metadata as of the last queue operation.
    #[must_use]
    pub fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    /// Wall-clock time of the record.
    #[must_use]
    pub fn t(&self) -> u64 {
        self.meta.t()
    }

    /// In-memory soft-mark bitmask (e.g. "ack pending"); never persisted.
    #[must_use]
    pub fn soft_mark(&self) -> u64 {
        self.soft_mark
    }

    /// Delivery attempts recorded so far.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether an ack timer is armed and already expired.
    #[must_use]
    pub fn ack_timer_expired(&self) -> bool {
        self.ack_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub(crate) fn arm_ack_timer(&mut self, timeout: Duration) {
        self.ack_deadline = Some(Instant::now() + timeout);
    }

    pub(crate) fn clear_ack_timer(&mut self) {
        self.ack_deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> QueueMessage {
        QueueMessage::new(1, "rows".to_string(), RecordMeta::new(100, 0, 1, 0, 10))
    }

    #[test]
    fn fresh_message_has_no_delivery_state() {
        let msg = message();
        assert_eq!(msg.soft_mark(), 0);
        assert_eq!(msg.retries(), 0);
        assert!(!msg.ack_timer_expired());
    }

    #[test]
    fn ack_timer_expires() {
        let mut msg = message();
        msg.arm_ack_timer(Duration::ZERO);
        assert!(msg.ack_timer_expired());

        msg.clear_ack_timer();
        assert!(!msg.ack_timer_expired());

        msg.arm_ack_timer(Duration::from_secs(3600));
        assert!(!msg.ack_timer_expired());
    }
}
