//! Database directory management.
//!
//! This module handles the file system layout for a chronolog database:
//!
//! ```text
//! <db_path>/
//! ├─ catalog.json          # Global settings; doubles as the writer lock
//! └─ <topic>/
//!    ├─ topic_desc.json    # Immutable topic descriptor
//!    ├─ topic_cols.json    # Schema: field -> default value
//!    ├─ topic_var.json     # Small mutable dictionary
//!    └─ keys/<key>/        # One directory per key stream
//!       ├─ <bucket>.jsonl  # Record payloads, one JSON document per line
//!       └─ <bucket>.idx    # Fixed-size metadata entries
//! ```
//!
//! The writer lock is an exclusive advisory lock on `catalog.json`: the one
//! process holding it is the master and may append and mutate topic
//! variables. Readers open the same file without a lock and must treat the
//! whole tree as read-only.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// File names within the database directory.
pub const CATALOG_FILE: &str = "catalog.json";
pub const TOPIC_DESC_FILE: &str = "topic_desc.json";
pub const TOPIC_COLS_FILE: &str = "topic_cols.json";
pub const TOPIC_VAR_FILE: &str = "topic_var.json";
/// Subdirectory of a topic holding one directory per key stream.
pub const KEYS_DIR: &str = "keys";
/// Extension of segment content files.
pub const CONTENT_EXT: &str = "jsonl";
/// Extension of segment index files.
pub const INDEX_EXT: &str = "idx";

/// Global settings persisted in `catalog.json` when a database is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSettings {
    /// Default segment filename mask for topics of this database.
    pub filename_mask: String,
    /// Database format version (major, minor).
    pub format_version: (u16, u16),
}

/// Manages the database directory structure and the single-writer lock.
///
/// A master `DatabaseDir` holds an exclusive advisory lock on the catalog
/// file for its whole lifetime; dropping it releases the lock.
#[derive(Debug)]
pub struct DatabaseDir {
    /// Root directory path.
    path: PathBuf,
    /// Whether this handle holds the writer lock.
    master: bool,
    /// Catalog file handle; holds the advisory lock while master.
    _catalog_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory.
    ///
    /// A master open acquires the exclusive writer lock, creating the
    /// directory and catalog if allowed. A reader open requires the catalog
    /// to already exist and takes no lock.
    ///
    /// # Errors
    ///
    /// - `LockHeld` when another master holds the lock
    /// - `InvalidDatabase` when the database is missing and cannot be
    ///   created (reader, or `create_if_missing` off)
    pub fn open(
        path: &Path,
        master: bool,
        create_if_missing: bool,
        defaults: &CatalogSettings,
    ) -> CoreResult<(Self, CatalogSettings)> {
        let catalog_path = path.join(CATALOG_FILE);

        if !catalog_path.exists() {
            if !master {
                return Err(CoreError::invalid_database(format!(
                    "database does not exist (reader open): {}",
                    path.display()
                )));
            }
            if !create_if_missing {
                return Err(CoreError::invalid_database(format!(
                    "database does not exist and create_if_missing is off: {}",
                    path.display()
                )));
            }
            fs::create_dir_all(path)?;
            save_json_file(path, CATALOG_FILE, &serde_json::to_value(defaults)?)?;
            tracing::info!(path = %path.display(), "created database catalog");
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_database(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let catalog_file = if master {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .truncate(false)
                .open(&catalog_path)?;
            if file.try_lock_exclusive().is_err() {
                return Err(CoreError::LockHeld);
            }
            file
        } else {
            File::open(&catalog_path)?
        };

        let settings: CatalogSettings = {
            let mut data = String::new();
            let mut file = File::open(&catalog_path)?;
            file.read_to_string(&mut data)?;
            serde_json::from_str(&data)
                .map_err(|e| CoreError::corrupted(format!("bad catalog file: {e}")))?
        };

        Ok((
            Self {
                path: path.to_path_buf(),
                master,
                _catalog_file: catalog_file,
            },
            settings,
        ))
    }

    /// Returns the path to the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle holds the writer lock.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.master
    }

    /// Returns the directory of a topic.
    #[must_use]
    pub fn topic_dir(&self, topic_name: &str) -> PathBuf {
        self.path.join(topic_name)
    }

    /// Returns the backup directory of a topic.
    #[must_use]
    pub fn topic_backup_dir(&self, topic_name: &str) -> PathBuf {
        self.path.join(format!("{topic_name}.bak"))
    }

    /// Returns the key-streams directory of a topic.
    #[must_use]
    pub fn topic_keys_dir(&self, topic_name: &str) -> PathBuf {
        self.topic_dir(topic_name).join(KEYS_DIR)
    }

    /// Lists topics present on disk (directories with a descriptor file).
    ///
    /// # Errors
    ///
    /// Returns an error when the database directory cannot be read.
    pub fn list_topics(&self) -> CoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            if entry.path().join(TOPIC_DESC_FILE).exists() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl Drop for DatabaseDir {
    fn drop(&mut self) {
        // Advisory lock is released when the catalog file handle closes.
    }
}

/// Saves a JSON value to `<dir>/<name>` atomically.
///
/// Uses the write-then-rename pattern for crash safety:
/// 1. Write to a temporary file and sync it
/// 2. Rename over the target
/// 3. Fsync the directory so the rename is durable
pub fn save_json_file(dir: &Path, name: &str, value: &Value) -> CoreResult<()> {
    let target = dir.join(name);
    let temp = dir.join(format!("{name}.tmp"));

    let data = serde_json::to_vec_pretty(value)?;
    let mut file = File::create(&temp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, &target)?;
    sync_directory(dir)?;

    Ok(())
}

/// Loads a JSON value from `<dir>/<name>`, or `None` if the file is missing
/// or empty.
pub fn load_json_file(dir: &Path, name: &str) -> CoreResult<Option<Value>> {
    let path = dir.join(name);
    if !path.exists() {
        return Ok(None);
    }

    let mut data = Vec::new();
    File::open(&path)?.read_to_end(&mut data)?;
    if data.is_empty() {
        return Ok(None);
    }

    let value = serde_json::from_slice(&data)
        .map_err(|e| CoreError::corrupted(format!("bad JSON file {}: {e}", path.display())))?;
    Ok(Some(value))
}

/// Syncs a directory so entry creations/renames are durable.
#[cfg(unix)]
pub fn sync_directory(dir: &Path) -> CoreResult<()> {
    let handle = File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub fn sync_directory(_dir: &Path) -> CoreResult<()> {
    // NTFS journaling covers metadata durability; directory fsync is not
    // available on Windows.
    Ok(())
}
