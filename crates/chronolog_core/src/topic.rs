//! Topic lifecycle and the append path.
//!
//! A topic is an independently partitioned append-only log inside a
//! database. On disk it is a directory holding an immutable descriptor, a
//! schema, a small mutable variables file and one directory per key stream
//! under `keys/`. Each key stream is a series of date-bucketed segment
//! files: a content file of JSON payloads and an index file of fixed-size
//! metadata entries.

use crate::dir::{
    self, CONTENT_EXT, INDEX_EXT, KEYS_DIR, TOPIC_COLS_FILE, TOPIC_DESC_FILE, TOPIC_VAR_FILE,
};
use crate::error::{CoreError, CoreResult};
use crate::feed::{RecordEvent, RecordFeed};
use crate::meta::{RecordMeta, META_RECORD_SIZE};
use crate::schema::Schema;
use crate::segment::{locate_segment, KeyCache, SegmentInfo};
use crate::types::{format_int_key, KeyType, Rowid, TimeUnit, ROWID_KEY};
use chronolog_storage::{FileBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Immutable topic descriptor, persisted as `topic_desc.json` at creation
/// and never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDesc {
    /// Topic name; also the directory name.
    pub topic_name: String,
    /// Payload field holding the record key; empty for rowid-keyed topics.
    pub pkey: String,
    /// Payload field holding the record's fine-grained time; optional.
    pub tkey: String,
    /// How records are keyed.
    pub key_type: KeyType,
    /// Resolution of record timestamps.
    pub time_unit: TimeUnit,
    /// strftime-style mask deriving a segment bucket from a record time.
    pub filename_mask: String,
}

/// Open file pair of the bucket currently being appended to for one key.
struct KeyWriter {
    bucket: String,
    content: FileBackend,
    index: FileBackend,
}

/// An open topic.
///
/// All mutation goes through the append path and the variables writer; the
/// segment catalog is only written by appends and only read by iterators,
/// so a read/write lock around it is the whole concurrency story.
pub struct Topic {
    name: String,
    dir: PathBuf,
    desc: TopicDesc,
    schema: Schema,
    master: bool,
    vars: RwLock<Map<String, Value>>,
    caches: RwLock<HashMap<String, KeyCache>>,
    writers: Mutex<HashMap<String, KeyWriter>>,
    readers: RwLock<HashMap<String, Arc<FileBackend>>>,
    feed: RecordFeed,
    iterators: Mutex<HashSet<String>>,
}

impl Topic {
    /// Writes a fresh topic's files: descriptor, schema, variables and the
    /// key-streams directory.
    pub(crate) fn create_on_disk(
        topic_dir: &std::path::Path,
        desc: &TopicDesc,
        schema: &Schema,
        vars: &Map<String, Value>,
    ) -> CoreResult<()> {
        fs::create_dir_all(topic_dir.join(KEYS_DIR))?;
        dir::save_json_file(topic_dir, TOPIC_DESC_FILE, &serde_json::to_value(desc)?)?;
        dir::save_json_file(topic_dir, TOPIC_COLS_FILE, &schema.to_json())?;
        dir::save_json_file(topic_dir, TOPIC_VAR_FILE, &Value::Object(vars.clone()))?;
        tracing::info!(topic = %desc.topic_name, path = %topic_dir.display(), "created topic");
        Ok(())
    }

    /// Opens a topic from its directory, rebuilding every key stream's
    /// segment catalog from a cheap index scan.
    pub(crate) fn open(topic_dir: PathBuf, name: &str, master: bool) -> CoreResult<Self> {
        let desc_value = dir::load_json_file(&topic_dir, TOPIC_DESC_FILE)?
            .ok_or_else(|| CoreError::topic_not_found(name))?;
        let desc: TopicDesc = serde_json::from_value(desc_value)
            .map_err(|e| CoreError::corrupted(format!("bad topic descriptor for {name}: {e}")))?;

        let schema = match dir::load_json_file(&topic_dir, TOPIC_COLS_FILE)? {
            Some(value) => Schema::from_json(value)?,
            None => Schema::new(),
        };

        let vars = match dir::load_json_file(&topic_dir, TOPIC_VAR_FILE)? {
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(CoreError::corrupted(format!(
                    "topic variables of {name} are not an object: {other}"
                )))
            }
            None => Map::new(),
        };

        let mut caches = HashMap::new();
        let keys_dir = topic_dir.join(KEYS_DIR);
        if keys_dir.is_dir() {
            for entry in fs::read_dir(&keys_dir)? {
                let entry = entry?;
                if !entry.path().is_dir() {
                    continue;
                }
                let Some(key) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                caches.insert(key, KeyCache::load(&entry.path())?);
            }
        }

        Ok(Self {
            name: name.to_string(),
            dir: topic_dir,
            desc,
            schema,
            master,
            vars: RwLock::new(vars),
            caches: RwLock::new(caches),
            writers: Mutex::new(HashMap::new()),
            readers: RwLock::new(HashMap::new()),
            feed: RecordFeed::new(),
            iterators: Mutex::new(HashSet::new()),
        })
    }

    /// Topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The immutable descriptor.
    #[must_use]
    pub fn desc(&self) -> &TopicDesc {
        &self.desc
    }

    /// The topic schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The topic's realtime feed.
    #[must_use]
    pub fn feed(&self) -> &RecordFeed {
        &self.feed
    }

    /// Reads one topic variable.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<Value> {
        self.vars.read().get(name).cloned()
    }

    /// Merges a patch into the topic variables and persists them
    /// synchronously. Master only.
    pub fn write_vars(&self, patch: Map<String, Value>) -> CoreResult<()> {
        if !self.master {
            return Err(CoreError::not_master(&self.name));
        }
        let mut vars = self.vars.write();
        for (name, value) in patch {
            vars.insert(name, value);
        }
        dir::save_json_file(&self.dir, TOPIC_VAR_FILE, &Value::Object(vars.clone()))
    }

    /// Total records over all key streams.
    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.caches.read().values().map(KeyCache::total_rows).sum()
    }

    /// Records in one key stream.
    #[must_use]
    pub fn key_rows(&self, key: &str) -> u64 {
        let stream = self.stream_name(key);
        self.caches
            .read()
            .get(stream.as_ref())
            .map_or(0, KeyCache::total_rows)
    }

    /// Key streams present, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.caches.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Runs a closure against one key's segment catalog. Unknown keys see
    /// an empty catalog, not an error.
    pub(crate) fn with_cache<R>(&self, key: &str, f: impl FnOnce(&KeyCache) -> R) -> R {
        let caches = self.caches.read();
        match caches.get(key) {
            Some(cache) => f(cache),
            None => f(&KeyCache::default()),
        }
    }

    /// Maps a caller-supplied key to the on-disk stream name.
    ///
    /// Rowid-keyed topics have a single stream regardless of the caller's
    /// key; other topics use the key as given.
    #[must_use]
    pub fn stream_name<'a>(&self, key: &'a str) -> std::borrow::Cow<'a, str> {
        match self.desc.key_type {
            KeyType::Rowid => std::borrow::Cow::Borrowed(ROWID_KEY),
            _ => std::borrow::Cow::Borrowed(key),
        }
    }

    /// Whether open iterators are registered.
    #[must_use]
    pub fn has_open_iterators(&self) -> bool {
        !self.iterators.lock().is_empty()
    }

    pub(crate) fn register_iterator(&self, id: &str) -> CoreResult<()> {
        if !self.iterators.lock().insert(id.to_string()) {
            return Err(CoreError::IteratorExists { id: id.to_string() });
        }
        Ok(())
    }

    pub(crate) fn unregister_iterator(&self, id: &str) -> CoreResult<()> {
        if !self.iterators.lock().remove(id) {
            return Err(CoreError::IteratorNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Appends a record to the topic.
    ///
    /// Assigns the next rowid of the record's key stream, writes payload
    /// then metadata, updates the segment catalog and notifies realtime
    /// subscribers. The metadata append is the commit point: a failure
    /// before it leaves no new row behind.
    pub fn append(&self, t: u64, user_flag: u32, payload: Value) -> CoreResult<RecordEvent> {
        if !self.master {
            return Err(CoreError::not_master(&self.name));
        }

        let record = self.schema.conform(payload)?;
        let key = self.record_key(&record)?;
        let t = if t == 0 { self.now() } else { t };
        let tm = self.record_tm(&record);
        let bucket = self.bucket_for(t)?;

        let mut encoded = serde_json::to_vec(&record)?;
        encoded.push(b'\n');

        let mut writers = self.writers.lock();
        let writer = self.writer_for(&mut writers, &key, &bucket)?;

        let offset = writer.content.size()?;
        writer.content.append(&encoded)?;

        let meta = RecordMeta::new(t, tm, user_flag, offset, encoded.len() as u64);
        writer.index.append(&meta.encode())?;
        drop(writers);

        let rowid = self
            .caches
            .write()
            .entry(key.clone())
            .or_default()
            .note_append(&bucket, &meta);

        let event = RecordEvent {
            key,
            rowid,
            meta,
            payload: Value::Object(record),
        };
        self.feed.emit(&event);
        Ok(event)
    }

    /// Reads the metadata entry of a rowid inside a resolved segment.
    pub(crate) fn read_meta(
        &self,
        key: &str,
        segment: &SegmentInfo,
        rowid: Rowid,
    ) -> CoreResult<RecordMeta> {
        let backend = self.reader(key, &segment.id, INDEX_EXT)?;
        let offset = (rowid - segment.first_row) * META_RECORD_SIZE;
        let data = read_refreshing(&backend, offset, META_RECORD_SIZE as usize)?;
        RecordMeta::decode(&data)
    }

    /// Reads and decodes the payload a metadata entry points at.
    pub(crate) fn read_payload(
        &self,
        key: &str,
        bucket: &str,
        meta: &RecordMeta,
    ) -> CoreResult<Value> {
        let backend = self.reader(key, bucket, CONTENT_EXT)?;
        let data = read_refreshing(&backend, meta.offset, meta.size as usize)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Reads the user flag of a rowid.
    pub fn read_user_flag(&self, key: &str, rowid: Rowid) -> CoreResult<u32> {
        let (_segment, meta) = self.meta_by_rowid(key, rowid)?;
        Ok(meta.user_flag())
    }

    /// Replaces the user flag of a rowid, rewriting its metadata entry in
    /// place. Master only.
    pub fn write_user_flag(&self, key: &str, rowid: Rowid, flag: u32) -> CoreResult<()> {
        self.rewrite_user_flag(key, rowid, |meta| meta.set_user_flag(flag))
    }

    /// Sets or clears a mask inside the user flag of a rowid. Master only.
    pub fn set_user_flag(&self, key: &str, rowid: Rowid, mask: u32, on: bool) -> CoreResult<()> {
        self.rewrite_user_flag(key, rowid, |meta| meta.apply_user_mask(mask, on))
    }

    /// Locates the segment covering a rowid and reads its metadata entry.
    pub(crate) fn meta_by_rowid(
        &self,
        key: &str,
        rowid: Rowid,
    ) -> CoreResult<(SegmentInfo, RecordMeta)> {
        let stream = self.stream_name(key).into_owned();
        let segments =
            self.with_cache(&stream, |cache| cache.resolve_rows(1, cache.total_rows().max(1)));
        let idx = locate_segment(&segments, rowid).ok_or_else(|| CoreError::RecordNotFound {
            topic: self.name.clone(),
            key: stream.clone(),
            rowid,
        })?;
        let meta = self.read_meta(&stream, &segments[idx], rowid)?;
        Ok((segments[idx].clone(), meta))
    }

    /// Flushes every open writer. Called on close and shutdown.
    pub(crate) fn flush(&self) -> CoreResult<()> {
        let mut writers = self.writers.lock();
        for writer in writers.values_mut() {
            writer.content.flush()?;
            writer.index.flush()?;
        }
        Ok(())
    }

    fn rewrite_user_flag(
        &self,
        key: &str,
        rowid: Rowid,
        update: impl FnOnce(&mut RecordMeta),
    ) -> CoreResult<()> {
        if !self.master {
            return Err(CoreError::not_master(&self.name));
        }

        let stream = self.stream_name(key).into_owned();
        let (segment, mut meta) = self.meta_by_rowid(&stream, rowid)?;
        update(&mut meta);

        let path = self
            .dir
            .join(KEYS_DIR)
            .join(&stream)
            .join(format!("{}.{INDEX_EXT}", segment.id));
        let mut backend = FileBackend::open(&path)?;
        let offset = (rowid - segment.first_row) * META_RECORD_SIZE;
        backend.write_at(offset, &meta.encode())?;
        backend.flush()?;
        Ok(())
    }

    /// Extracts the key stream of a record per the topic's key type.
    fn record_key(&self, record: &Map<String, Value>) -> CoreResult<String> {
        match self.desc.key_type {
            KeyType::Rowid => Ok(ROWID_KEY.to_string()),
            KeyType::String => match record.get(&self.desc.pkey).and_then(Value::as_str) {
                Some(key) if !key.is_empty() => Ok(key.to_string()),
                _ => Err(CoreError::schema_mismatch(format!(
                    "record has no key field {}",
                    self.desc.pkey
                ))),
            },
            KeyType::Integer => match record.get(&self.desc.pkey).and_then(Value::as_u64) {
                Some(value) => Ok(format_int_key(value)),
                None => Err(CoreError::schema_mismatch(format!(
                    "record has no integer key field {}",
                    self.desc.pkey
                ))),
            },
        }
    }

    /// The record's fine-grained time: the tkey field when present and
    /// integral, 0 otherwise.
    fn record_tm(&self, record: &Map<String, Value>) -> u64 {
        if self.desc.tkey.is_empty() {
            return 0;
        }
        record
            .get(&self.desc.tkey)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Current time in the topic's unit.
    fn now(&self) -> u64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        match self.desc.time_unit {
            TimeUnit::Seconds => elapsed.as_secs(),
            TimeUnit::Milliseconds => elapsed.as_millis() as u64,
        }
    }

    /// Derives the segment bucket name for a record time.
    fn bucket_for(&self, t: u64) -> CoreResult<String> {
        let secs = match self.desc.time_unit {
            TimeUnit::Seconds => t,
            TimeUnit::Milliseconds => t / 1000,
        };
        let dt = chrono::DateTime::<chrono::Utc>::from_timestamp(secs as i64, 0)
            .ok_or_else(|| CoreError::schema_mismatch(format!("record time out of range: {t}")))?;
        Ok(dt.format(&self.desc.filename_mask).to_string())
    }

    /// Returns the writer pair for a key, rotating to a new bucket when the
    /// record time crossed a date boundary.
    fn writer_for<'a>(
        &self,
        writers: &'a mut HashMap<String, KeyWriter>,
        key: &str,
        bucket: &str,
    ) -> CoreResult<&'a mut KeyWriter> {
        let needs_open = match writers.get(key) {
            Some(writer) => writer.bucket != bucket,
            None => true,
        };
        if needs_open {
            let key_dir = self.dir.join(KEYS_DIR).join(key);
            let content =
                FileBackend::open_with_create_dirs(&key_dir.join(format!("{bucket}.{CONTENT_EXT}")))?;
            let index =
                FileBackend::open_with_create_dirs(&key_dir.join(format!("{bucket}.{INDEX_EXT}")))?;
            writers.insert(
                key.to_string(),
                KeyWriter {
                    bucket: bucket.to_string(),
                    content,
                    index,
                },
            );
        }
        Ok(writers.get_mut(key).expect("writer just inserted"))
    }

    /// Returns a cached read-only backend for a segment file.
    fn reader(&self, key: &str, bucket: &str, ext: &str) -> CoreResult<Arc<FileBackend>> {
        let cache_key = format!("{key}/{bucket}.{ext}");
        if let Some(backend) = self.readers.read().get(&cache_key) {
            return Ok(Arc::clone(backend));
        }

        let path = self
            .dir
            .join(KEYS_DIR)
            .join(key)
            .join(format!("{bucket}.{ext}"));
        let backend = Arc::new(FileBackend::open_read_only(&path)?);
        self.readers
            .write()
            .insert(cache_key, Arc::clone(&backend));
        Ok(backend)
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("key_type", &self.desc.key_type)
            .field("total_rows", &self.total_rows())
            .finish_non_exhaustive()
    }
}

/// Reads from a backend, refreshing its cached length first when the range
/// reaches past it. Readers of a file the master is still appending to see
/// a stale size until refreshed.
fn read_refreshing(
    backend: &Arc<FileBackend>,
    offset: u64,
    len: usize,
) -> CoreResult<Vec<u8>> {
    if offset + len as u64 > backend.size()? {
        backend.refresh_size()?;
    }
    Ok(backend.read_at(offset, len)?)
}
