//! Error types for the chronolog core engine.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in chronolog core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] chronolog_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encode/decode error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another process already holds the single-writer lock.
    #[error("database locked: another writer has exclusive access")]
    LockHeld,

    /// A write operation was attempted by a non-master handle.
    #[error("not master: topic {topic} is open read-only")]
    NotMaster {
        /// The topic on which the write was attempted.
        topic: String,
    },

    /// A topic was reopened with an incompatible shape.
    #[error("schema conflict on topic {topic}: {message}")]
    SchemaConflict {
        /// The topic being reopened.
        topic: String,
        /// What differs from the persisted descriptor.
        message: String,
    },

    /// A record payload does not conform to the topic shape.
    #[error("schema mismatch: {message}")]
    SchemaMismatch {
        /// Description of the violation.
        message: String,
    },

    /// A referenced topic does not exist or is not open.
    #[error("topic not found: {name}")]
    TopicNotFound {
        /// Name of the topic.
        name: String,
    },

    /// A referenced iterator id does not exist.
    #[error("iterator not found: {id}")]
    IteratorNotFound {
        /// The iterator id.
        id: String,
    },

    /// A referenced rowid does not exist in its key stream.
    #[error("record not found: topic {topic}, key {key}, rowid {rowid}")]
    RecordNotFound {
        /// The topic searched.
        topic: String,
        /// The key stream searched.
        key: String,
        /// The rowid that was not found.
        rowid: u64,
    },

    /// An iterator id is already registered on the topic.
    #[error("iterator already exists: {id}")]
    IteratorExists {
        /// The iterator id.
        id: String,
    },

    /// Shutdown was requested while iterators remain open.
    #[error("iterators still open on topic {topic}")]
    IteratorsOpen {
        /// The topic with open iterators.
        topic: String,
    },

    /// An on-disk structure is malformed.
    #[error("corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Invalid database layout or missing database.
    #[error("invalid database: {message}")]
    InvalidDatabase {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates a not-master error.
    pub fn not_master(topic: impl Into<String>) -> Self {
        Self::NotMaster {
            topic: topic.into(),
        }
    }

    /// Creates a schema conflict error.
    pub fn schema_conflict(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaConflict {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Creates a schema mismatch error.
    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    /// Creates a topic-not-found error.
    pub fn topic_not_found(name: impl Into<String>) -> Self {
        Self::TopicNotFound { name: name.into() }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates an invalid database error.
    pub fn invalid_database(message: impl Into<String>) -> Self {
        Self::InvalidDatabase {
            message: message.into(),
        }
    }
}
