//! Record feed for tailing live appends.
//!
//! Every topic owns a feed. The append path emits an event per stored
//! record; subscriptions deliver those events in arrival order to whoever
//! is tailing the topic — an iterator opened without an upper bound, or the
//! queue layer watching for new work.
//!
//! Subscriptions are addressed by small integer ids handed out by the feed,
//! so nothing outside the feed ever holds a raw callback or channel
//! internals; closing an iterator just returns its id.

use crate::meta::RecordMeta;
use crate::types::Rowid;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};

/// Identifier of one feed subscription.
pub type SubscriptionId = u64;

/// A single record event emitted after a successful append.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEvent {
    /// Key stream the record belongs to.
    pub key: String,
    /// Rowid assigned to the record.
    pub rowid: Rowid,
    /// The record's metadata entry.
    pub meta: RecordMeta,
    /// The stored payload.
    pub payload: Value,
}

struct Subscription {
    /// Deliver only this key's records when set; all keys otherwise.
    key: Option<String>,
    sender: Sender<RecordEvent>,
}

/// Distributes append events to subscribers.
///
/// - Emits only successfully stored records
/// - Preserves append order
/// - Supports multiple subscribers, each with an optional key filter
#[derive(Default)]
pub struct RecordFeed {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    next_id: RwLock<SubscriptionId>,
}

impl RecordFeed {
    /// Creates a feed with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the feed.
    ///
    /// With a key filter only that stream's records are delivered. Returns
    /// the subscription id and the receiving end of the event channel.
    pub fn subscribe(&self, key: Option<&str>) -> (SubscriptionId, Receiver<RecordEvent>) {
        let (tx, rx) = mpsc::channel();
        let id = {
            let mut next = self.next_id.write();
            *next += 1;
            *next
        };
        self.subscriptions.write().insert(
            id,
            Subscription {
                key: key.map(str::to_string),
                sender: tx,
            },
        );
        (id, rx)
    }

    /// Removes a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.write().remove(&id);
    }

    /// Emits an event to every matching subscriber.
    ///
    /// Called by the append path after the record is on disk. Disconnected
    /// subscribers are pruned as a side effect.
    pub fn emit(&self, event: &RecordEvent) {
        let mut subscriptions = self.subscriptions.write();
        subscriptions.retain(|_, sub| {
            match &sub.key {
                Some(key) if key != &event.key => true,
                _ => sub.sender.send(event.clone()).is_ok(),
            }
        });
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl std::fmt::Debug for RecordFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordFeed")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
