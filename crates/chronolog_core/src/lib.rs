//! # chronolog core
//!
//! A time-partitioned, rowid-indexed record log over flat files.
//!
//! Records are appended per logical key, partitioned into date-bounded
//! segment files, and retrieved through iterators supporting absolute and
//! relative rowid ranges, time windows, forward/backward delivery,
//! pagination and realtime tailing of live appends.
//!
//! This crate provides:
//! - Database catalog with a single-writer lock (one master, many readers)
//! - Topics: independently partitioned append-only logs with schemas
//! - Segment catalog rebuilt from a cheap index scan at open
//! - Append engine assigning monotonic rowids
//! - Iterator/query engine with documented range normalization
//! - A record feed for tailing live appends
//!
//! ## Example
//!
//! ```no_run
//! use chronolog_core::{Config, Database, MatchCond, TopicSpec};
//! use serde_json::json;
//!
//! let db = Database::open("my_db".as_ref(), Config::new().master(true))?;
//! db.create_topic(TopicSpec::new("readings").pkey("device"))?;
//!
//! let stored = db.append_record("readings", 0, 0, json!({"device": "d1", "v": 21.5}))?;
//! assert_eq!(stored.rowid, 1);
//!
//! let it = db.open_iterator("readings", "d1", None, MatchCond::new(), None)?;
//! let page = db.get_page(&it, 1, 100, false)?;
//! assert_eq!(page.records.len(), 1);
//! db.close_iterator(it)?;
//! # Ok::<(), chronolog_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod db;
mod dir;
mod error;
mod feed;
mod iter;
mod meta;
mod schema;
mod segment;
mod topic;
mod types;

pub use config::{Config, DEFAULT_FILENAME_MASK};
pub use db::{Database, TopicSpec};
pub use error::{CoreError, CoreResult};
pub use feed::{RecordEvent, RecordFeed, SubscriptionId};
pub use iter::{
    compute_pages, normalize_rowid_range, normalize_time_range, MatchCond, Page, RecordCallback,
    RecordIterator, ScanControl,
};
pub use meta::{RecordMeta, META_RECORD_SIZE, SYS_FLAG_LOADED_FROM_DISK};
pub use schema::Schema;
pub use segment::{KeyCache, KeyTotals, SegmentInfo, SegmentStats};
pub use topic::{Topic, TopicDesc};
pub use types::{format_int_key, KeyType, Rowid, TimeUnit, ROWID_KEY};
