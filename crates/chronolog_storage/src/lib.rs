//! # chronolog storage
//!
//! Byte-store backends for the chronolog record log.
//!
//! This crate provides the lowest-level storage abstraction for chronolog.
//! Backends are **opaque byte stores** — they do not interpret the data they
//! hold. The record log owns every on-disk format (content files, metadata
//! index files); backends only read, append and patch bytes.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, append, patch, flush)
//! - No knowledge of segment layouts or record formats
//! - Must be `Send + Sync` so one backend can serve many readers
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral stores
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use chronolog_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
