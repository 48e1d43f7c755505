//! # chronolog queue
//!
//! Persistent at-least-once message queue over the chronolog record log.
//!
//! Messages are records in a rowid-keyed topic, appended with a persisted
//! "pending" flag bit. The queue keeps an in-memory active list of loaded
//! messages; acknowledging a message clears the persisted bit so it is
//! never replayed, while everything still pending is reconstructed by
//! [`Queue::load`] after a restart. Ack marks, timers and retry counters
//! are memory-only — recovery downgrades an ack-waiting message to plain
//! pending, which is exactly at-least-once, never exactly-once.
//!
//! Size-bounded workloads can configure a backup threshold: once the topic
//! grows past it, [`Queue::check_backup`] archives the topic's contents and
//! starts over, keeping on-disk growth bounded for queues whose history
//! need not be retained once drained.
//!
//! ## Example
//!
//! ```no_run
//! use chronolog_core::{Config, Database};
//! use chronolog_queue::Queue;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let db = Arc::new(Database::open("my_db".as_ref(), Config::new().master(true))?);
//! let mut queue = Queue::open(Arc::clone(&db), "outbox", "", 10_000)?;
//!
//! // Recover whatever a previous run left pending
//! queue.load()?;
//!
//! let rowid = queue.append(0, json!({"to": "peer", "body": "hi"}))?;
//! // ... deliver it, then acknowledge:
//! queue.unload(rowid, 0)?;
//! # Ok::<(), chronolog_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod msg;
mod queue;

pub use msg::QueueMessage;
pub use queue::{Queue, MSG_PENDING};
