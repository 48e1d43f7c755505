//! Database facade: open/create lifecycle, topics, appends, iterators.

use crate::config::Config;
use crate::dir::{CatalogSettings, DatabaseDir, TOPIC_COLS_FILE, TOPIC_DESC_FILE, TOPIC_VAR_FILE};
use crate::error::{CoreError, CoreResult};
use crate::feed::RecordEvent;
use crate::iter::{
    compute_pages, record_matches, resolve_query, Cursor, MatchCond, Page, RecordCallback,
    RecordIterator, ResolvedQuery, ScanControl,
};
use crate::meta::SYS_FLAG_LOADED_FROM_DISK;
use crate::schema::Schema;
use crate::topic::{Topic, TopicDesc};
use crate::types::{KeyType, Rowid, TimeUnit};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Everything needed to create (or reopen) a topic.
///
/// Only `name` is mandatory. Reopening an existing topic checks any shape
/// fields that were supplied against the persisted descriptor and fails
/// with `SchemaConflict` on a mismatch; an empty spec just opens the topic.
#[derive(Debug, Clone, Default)]
pub struct TopicSpec {
    /// Topic name.
    pub name: String,
    /// Payload field holding the record key; empty for rowid-keyed topics.
    pub pkey: String,
    /// Payload field holding the record's fine-grained time.
    pub tkey: String,
    /// Key type; derived from `pkey` when not given.
    pub key_type: Option<KeyType>,
    /// Timestamp resolution.
    pub time_unit: TimeUnit,
    /// Field → default map for payload conformance.
    pub schema: Schema,
    /// Segment filename mask; the database default when not given.
    pub filename_mask: Option<String>,
    /// Initial topic variables.
    pub vars: Map<String, Value>,
    /// Bumping this past the stored value resets schema and variables.
    pub topic_version: Option<u64>,
}

impl TopicSpec {
    /// Starts a spec for the named topic.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the primary-key field.
    #[must_use]
    pub fn pkey(mut self, field: impl Into<String>) -> Self {
        self.pkey = field.into();
        self
    }

    /// Sets the time-key field.
    #[must_use]
    pub fn tkey(mut self, field: impl Into<String>) -> Self {
        self.tkey = field.into();
        self
    }

    /// Sets the key type explicitly.
    #[must_use]
    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = Some(key_type);
        self
    }

    /// Sets the timestamp resolution.
    #[must_use]
    pub fn time_unit(mut self, unit: TimeUnit) -> Self {
        self.time_unit = unit;
        self
    }

    /// Sets the topic schema.
    #[must_use]
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Sets the segment filename mask.
    #[must_use]
    pub fn filename_mask(mut self, mask: impl Into<String>) -> Self {
        self.filename_mask = Some(mask.into());
        self
    }

    /// Adds an initial topic variable.
    #[must_use]
    pub fn var(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    /// Sets the topic version for migration-by-replacement.
    #[must_use]
    pub fn topic_version(mut self, version: u64) -> Self {
        self.topic_version = Some(version);
        self
    }
}

/// The database handle: a directory of topics plus the single-writer lock.
///
/// One process opens the database as master and is the only writer; any
/// number of others open it read-only and run iterators. All methods take
/// `&self`; the handle is usually shared as an `Arc<Database>`.
pub struct Database {
    config: Config,
    dir: DatabaseDir,
    settings: CatalogSettings,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl Database {
    /// Opens or creates a database at `path`.
    ///
    /// # Errors
    ///
    /// - `LockHeld` when `config.master` and another master is alive; the
    ///   caller may retry with `master` off to open read-only
    /// - `InvalidDatabase` when the database is missing and cannot be
    ///   created, or its format version is incompatible
    pub fn open(path: &Path, config: Config) -> CoreResult<Self> {
        let defaults = CatalogSettings {
            filename_mask: config.filename_mask.clone(),
            format_version: config.format_version,
        };
        let (dir, settings) = DatabaseDir::open(
            path,
            config.master,
            config.create_if_missing,
            &defaults,
        )?;

        if settings.format_version.0 != config.format_version.0 {
            return Err(CoreError::invalid_database(format!(
                "incompatible format version: database is v{}.{}, expected v{}.{}",
                settings.format_version.0,
                settings.format_version.1,
                config.format_version.0,
                config.format_version.1
            )));
        }

        tracing::info!(
            path = %path.display(),
            master = config.master,
            "opened database"
        );

        Ok(Self {
            config,
            dir,
            settings,
            topics: RwLock::new(HashMap::new()),
        })
    }

    /// Whether this handle is the single writer.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.dir.is_master()
    }

    /// The configuration this handle was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Topics present on disk, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be read.
    pub fn list_topics(&self) -> CoreResult<Vec<String>> {
        self.dir.list_topics()
    }

    /// Creates a topic if it does not exist, otherwise opens it.
    ///
    /// Creation is master-only. Reopening checks the supplied shape fields
    /// against the stored descriptor. When a newer `topic_version` is
    /// supplied (master only), the persisted schema and variables are reset
    /// from the spec before opening.
    ///
    /// # Errors
    ///
    /// `SchemaConflict` on a shape mismatch, `TopicNotFound` when a reader
    /// names a topic that does not exist.
    pub fn create_topic(&self, spec: TopicSpec) -> CoreResult<Arc<Topic>> {
        let topic_dir = self.dir.topic_dir(&spec.name);
        let exists = topic_dir.join(TOPIC_DESC_FILE).exists();

        if !exists {
            if !self.is_master() {
                return Err(CoreError::topic_not_found(&spec.name));
            }
            let key_type = spec.key_type.unwrap_or(if spec.pkey.is_empty() {
                KeyType::Rowid
            } else {
                KeyType::String
            });
            if key_type != KeyType::Rowid && spec.pkey.is_empty() {
                return Err(CoreError::schema_mismatch(format!(
                    "topic {} needs a pkey for key type {key_type}",
                    spec.name
                )));
            }

            let desc = TopicDesc {
                topic_name: spec.name.clone(),
                pkey: spec.pkey.clone(),
                tkey: spec.tkey.clone(),
                key_type,
                time_unit: spec.time_unit,
                filename_mask: spec
                    .filename_mask
                    .clone()
                    .unwrap_or_else(|| self.settings.filename_mask.clone()),
            };
            let mut vars = spec.vars.clone();
            if let Some(version) = spec.topic_version {
                vars.insert("topic_version".to_string(), Value::from(version));
            }
            Topic::create_on_disk(&topic_dir, &desc, &spec.schema, &vars)?;
        } else {
            let stored = self.stored_desc(&spec.name)?;

            if !spec.pkey.is_empty() && spec.pkey != stored.pkey {
                return Err(CoreError::schema_conflict(
                    &spec.name,
                    format!("pkey is {}, requested {}", stored.pkey, spec.pkey),
                ));
            }
            if !spec.tkey.is_empty() && spec.tkey != stored.tkey {
                return Err(CoreError::schema_conflict(
                    &spec.name,
                    format!("tkey is {}, requested {}", stored.tkey, spec.tkey),
                ));
            }
            if let Some(key_type) = spec.key_type {
                if key_type != stored.key_type {
                    return Err(CoreError::schema_conflict(
                        &spec.name,
                        format!("key type is {}, requested {key_type}", stored.key_type),
                    ));
                }
            }

            if self.is_master() {
                self.migrate_topic_files(&spec, &topic_dir)?;
            }
        }

        self.open_topic(&spec.name)
    }

    /// Opens a topic (idempotent; repeated opens share one handle).
    ///
    /// # Errors
    ///
    /// `TopicNotFound` when the topic does not exist on disk.
    pub fn open_topic(&self, name: &str) -> CoreResult<Arc<Topic>> {
        if let Some(topic) = self.topics.read().get(name) {
            return Ok(Arc::clone(topic));
        }

        let topic = Arc::new(Topic::open(self.dir.topic_dir(name), name, self.is_master())?);
        let mut topics = self.topics.write();
        Ok(Arc::clone(topics.entry(name.to_string()).or_insert(topic)))
    }

    /// Returns an open topic, opening it on first use.
    ///
    /// # Errors
    ///
    /// `TopicNotFound` when the topic does not exist.
    pub fn topic(&self, name: &str) -> CoreResult<Arc<Topic>> {
        self.open_topic(name)
    }

    /// Closes a topic, flushing its writers and dropping the shared handle.
    ///
    /// # Errors
    ///
    /// `IteratorsOpen` when iterators are still registered on it.
    pub fn close_topic(&self, name: &str) -> CoreResult<()> {
        let mut topics = self.topics.write();
        let Some(topic) = topics.get(name) else {
            return Err(CoreError::topic_not_found(name));
        };
        if topic.has_open_iterators() {
            return Err(CoreError::IteratorsOpen {
                topic: name.to_string(),
            });
        }
        topic.flush()?;
        topics.remove(name);
        Ok(())
    }

    /// Deletes a topic and everything under it. Master only.
    ///
    /// # Errors
    ///
    /// `NotMaster`, `TopicNotFound`, or `IteratorsOpen`.
    pub fn delete_topic(&self, name: &str) -> CoreResult<()> {
        if !self.is_master() {
            return Err(CoreError::not_master(name));
        }
        let topic_dir = self.dir.topic_dir(name);
        if !topic_dir.join(TOPIC_DESC_FILE).exists() {
            return Err(CoreError::topic_not_found(name));
        }
        if self.topics.read().contains_key(name) {
            self.close_topic(name)?;
        }
        fs::remove_dir_all(&topic_dir)?;
        tracing::info!(topic = name, "deleted topic");
        Ok(())
    }

    /// Archives a topic's contents and re-creates it empty. Master only.
    ///
    /// The topic directory moves to `<name>.bak`, replacing any previous
    /// backup, and a fresh topic with the same descriptor and schema takes
    /// its place. Queue-shaped workloads use this to bound on-disk growth.
    ///
    /// # Errors
    ///
    /// `NotMaster`, `TopicNotFound`, or `IteratorsOpen`.
    pub fn backup_topic(&self, name: &str) -> CoreResult<Arc<Topic>> {
        if !self.is_master() {
            return Err(CoreError::not_master(name));
        }
        let topic = self.open_topic(name)?;
        if topic.has_open_iterators() {
            return Err(CoreError::IteratorsOpen {
                topic: name.to_string(),
            });
        }

        let desc = topic.desc().clone();
        let schema = topic.schema().clone();
        topic.flush()?;
        self.topics.write().remove(name);
        drop(topic);

        let topic_dir = self.dir.topic_dir(name);
        let backup_dir = self.dir.topic_backup_dir(name);
        if backup_dir.exists() {
            fs::remove_dir_all(&backup_dir)?;
        }
        fs::rename(&topic_dir, &backup_dir)?;
        crate::dir::sync_directory(self.dir.path())?;

        Topic::create_on_disk(&topic_dir, &desc, &schema, &Map::new())?;
        tracing::info!(topic = name, backup = %backup_dir.display(), "archived topic");

        self.open_topic(name)
    }

    /// Total records of a topic over all key streams.
    ///
    /// # Errors
    ///
    /// `TopicNotFound` when the topic does not exist.
    pub fn topic_size(&self, name: &str) -> CoreResult<u64> {
        Ok(self.open_topic(name)?.total_rows())
    }

    /// Records of one key stream of a topic.
    ///
    /// # Errors
    ///
    /// `TopicNotFound` when the topic does not exist.
    pub fn topic_key_size(&self, name: &str, key: &str) -> CoreResult<u64> {
        Ok(self.open_topic(name)?.key_rows(key))
    }

    /// Merges a patch into a topic's persisted variables. Master only.
    ///
    /// # Errors
    ///
    /// `NotMaster` or `TopicNotFound`.
    pub fn write_topic_var(&self, name: &str, patch: Map<String, Value>) -> CoreResult<()> {
        self.open_topic(name)?.write_vars(patch)
    }

    /// Appends a record to a topic.
    ///
    /// Assigns the next rowid of the record's key stream, stores payload
    /// and metadata, and notifies realtime subscribers. Returns the full
    /// record event so the caller can echo it onward.
    ///
    /// # Errors
    ///
    /// `NotMaster`, `SchemaMismatch`, or I/O errors. A failed append never
    /// leaves a partially-visible row: the metadata write is the commit
    /// point.
    pub fn append_record(
        &self,
        topic_name: &str,
        t: u64,
        user_flag: u32,
        payload: Value,
    ) -> CoreResult<RecordEvent> {
        self.open_topic(topic_name)?.append(t, user_flag, payload)
    }

    /// Reads one record by rowid.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when the rowid is outside the key stream.
    pub fn read_record(&self, topic_name: &str, key: &str, rowid: Rowid) -> CoreResult<RecordEvent> {
        let topic = self.open_topic(topic_name)?;
        let stream = topic.stream_name(key).into_owned();
        let (segment, meta) = topic.meta_by_rowid(&stream, rowid)?;
        let payload = topic.read_payload(&stream, &segment.id, &meta)?;
        Ok(RecordEvent {
            key: stream,
            rowid,
            meta,
            payload,
        })
    }

    /// Reads the user flag of one record.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when the rowid is outside the key stream.
    pub fn read_user_flag(&self, topic_name: &str, key: &str, rowid: Rowid) -> CoreResult<u32> {
        self.open_topic(topic_name)?.read_user_flag(key, rowid)
    }

    /// Replaces the user flag of one record. Master only.
    ///
    /// # Errors
    ///
    /// `NotMaster` or `RecordNotFound`.
    pub fn write_user_flag(
        &self,
        topic_name: &str,
        key: &str,
        rowid: Rowid,
        flag: u32,
    ) -> CoreResult<()> {
        self.open_topic(topic_name)?.write_user_flag(key, rowid, flag)
    }

    /// Sets or clears a mask inside the user flag of one record. Master
    /// only.
    ///
    /// # Errors
    ///
    /// `NotMaster` or `RecordNotFound`.
    pub fn set_user_flag(
        &self,
        topic_name: &str,
        key: &str,
        rowid: Rowid,
        mask: u32,
        on: bool,
    ) -> CoreResult<()> {
        self.open_topic(topic_name)?.set_user_flag(key, rowid, mask, on)
    }

    /// Opens an iterator over a topic.
    ///
    /// The stored range matching `cond` is scanned immediately; when a
    /// callback is given it is invoked synchronously per record, and may
    /// stop the scan. When `cond` has no upper bound the iterator stays
    /// subscribed to the topic's feed and keeps receiving live appends
    /// until closed.
    ///
    /// An empty `key` on a keyed topic scans every key stream in key order
    /// (such an iterator supports callbacks and tailing, but not
    /// pagination). Opening on an unknown key yields an iterator with zero
    /// rows, not an error.
    ///
    /// # Errors
    ///
    /// `IteratorExists` when `id` is already registered on the topic;
    /// I/O errors stop the scan at the last delivered rowid.
    pub fn open_iterator(
        &self,
        topic_name: &str,
        key: &str,
        id: Option<&str>,
        cond: MatchCond,
        mut on_record: Option<&mut RecordCallback<'_>>,
    ) -> CoreResult<RecordIterator> {
        let topic = self.open_topic(topic_name)?;
        let stream = topic.stream_name(key).into_owned();

        let iterator_id = match id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ if !stream.is_empty() => stream.clone(),
            _ => topic_name.to_string(),
        };
        topic.register_iterator(&iterator_id)?;

        let scanned: CoreResult<ResolvedQuery> = if stream.is_empty() {
            // All keys: apply the condition to every stream in order.
            (|| {
                if let Some(callback) = on_record.as_mut() {
                    for key in topic.keys() {
                        let resolved = topic.with_cache(&key, |c| resolve_query(c, &cond));
                        if scan_stream(&topic, &key, &cond, &resolved, &mut **callback)?
                            == ScanControl::Stop
                        {
                            break;
                        }
                    }
                }
                Ok(ResolvedQuery {
                    segments: Vec::new(),
                    span: None,
                    time: None,
                    total_rows: topic.total_rows(),
                })
            })()
        } else {
            (|| {
                let resolved = topic.with_cache(&stream, |c| resolve_query(c, &cond));
                if let Some(callback) = on_record.as_mut() {
                    scan_stream(&topic, &stream, &cond, &resolved, &mut **callback)?;
                }
                Ok(resolved)
            })()
        };

        let resolved = match scanned {
            Ok(resolved) => resolved,
            Err(e) => {
                let _ = topic.unregister_iterator(&iterator_id);
                return Err(e);
            }
        };

        let realtime = cond.wants_realtime().then(|| {
            let filter = (!stream.is_empty()).then_some(stream.as_str());
            topic.feed().subscribe(filter)
        });

        Ok(RecordIterator {
            id: iterator_id,
            topic_name: topic_name.to_string(),
            key: stream,
            cond,
            segments: resolved.segments,
            span: resolved.span,
            time: resolved.time,
            total_rows: resolved.total_rows,
            realtime,
        })
    }

    /// Closes an iterator, releasing its realtime subscription and id.
    ///
    /// # Errors
    ///
    /// `IteratorNotFound` when the iterator was not registered.
    pub fn close_iterator(&self, iterator: RecordIterator) -> CoreResult<()> {
        let topic = self.open_topic(&iterator.topic_name)?;
        if let Some((subscription, _)) = &iterator.realtime {
            topic.feed().unsubscribe(*subscription);
        }
        topic.unregister_iterator(&iterator.id)
    }

    /// Fetches one page of records through an iterator.
    ///
    /// `from_rowid` is 1-based and absolute. The page covers rowids
    /// `from_rowid .. from_rowid + limit - 1` inside the iterator's range,
    /// delivered ascending or descending per `backward`. The last page is
    /// short when `total_rows` is not a multiple of `limit`.
    ///
    /// # Errors
    ///
    /// I/O errors while reading records.
    pub fn get_page(
        &self,
        iterator: &RecordIterator,
        from_rowid: i64,
        limit: u64,
        backward: bool,
    ) -> CoreResult<Page> {
        let total = iterator.total_rows;
        let empty = |pages| Page {
            total_rows: total,
            pages,
            records: Vec::new(),
        };

        if from_rowid <= 0 || from_rowid as u64 > total || limit == 0 {
            return Ok(empty(0));
        }
        let Some((span_from, span_to)) = iterator.span else {
            return Ok(empty(0));
        };

        let from = (from_rowid as u64).max(span_from);
        let to = (from_rowid as u64 + limit - 1).min(span_to);
        if from > to {
            return Ok(empty(0));
        }

        let topic = self.open_topic(&iterator.topic_name)?;
        let page_cond = MatchCond::new().backward(backward);
        let resolved = ResolvedQuery {
            segments: iterator.segments.clone(),
            span: Some((from, to)),
            time: None,
            total_rows: total,
        };

        let mut records = Vec::new();
        let mut collect = |key: &str,
                           rowid: Rowid,
                           meta: &crate::meta::RecordMeta,
                           payload: Option<&Value>|
         -> ScanControl {
            records.push(RecordEvent {
                key: key.to_string(),
                rowid,
                meta: *meta,
                payload: payload.cloned().unwrap_or(Value::Null),
            });
            ScanControl::Continue
        };
        scan_stream(&topic, &iterator.key, &page_cond, &resolved, &mut collect)?;

        Ok(Page {
            total_rows: total,
            pages: compute_pages(total, limit),
            records,
        })
    }

    /// Flushes and closes every topic.
    ///
    /// # Errors
    ///
    /// `IteratorsOpen` when any topic still has registered iterators;
    /// close them first.
    pub fn shutdown(&self) -> CoreResult<()> {
        let mut topics = self.topics.write();
        for (name, topic) in topics.iter() {
            if topic.has_open_iterators() {
                return Err(CoreError::IteratorsOpen {
                    topic: name.clone(),
                });
            }
        }
        for topic in topics.values() {
            topic.flush()?;
        }
        topics.clear();
        tracing::info!(path = %self.dir.path().display(), "database shut down");
        Ok(())
    }

    fn stored_desc(&self, name: &str) -> CoreResult<TopicDesc> {
        let value = crate::dir::load_json_file(&self.dir.topic_dir(name), TOPIC_DESC_FILE)?
            .ok_or_else(|| CoreError::topic_not_found(name))?;
        serde_json::from_value(value)
            .map_err(|e| CoreError::corrupted(format!("bad topic descriptor for {name}: {e}")))
    }

    /// Migration by replacement: a newer `topic_version` in the spec resets
    /// the persisted schema and variables.
    fn migrate_topic_files(&self, spec: &TopicSpec, topic_dir: &Path) -> CoreResult<()> {
        let Some(new_version) = spec.topic_version else {
            return Ok(());
        };
        let stored_version = crate::dir::load_json_file(topic_dir, TOPIC_VAR_FILE)?
            .as_ref()
            .and_then(|vars| vars.get("topic_version"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if new_version <= stored_version {
            return Ok(());
        }

        let mut vars = spec.vars.clone();
        vars.insert("topic_version".to_string(), Value::from(new_version));
        crate::dir::save_json_file(topic_dir, TOPIC_COLS_FILE, &spec.schema.to_json())?;
        crate::dir::save_json_file(topic_dir, TOPIC_VAR_FILE, &Value::Object(vars))?;
        self.topics.write().remove(&spec.name);
        tracing::info!(
            topic = %spec.name,
            version = new_version,
            "reset topic schema and variables for new version"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.dir.path())
            .field("master", &self.is_master())
            .field("open_topics", &self.topics.read().len())
            .finish_non_exhaustive()
    }
}

/// Walks one stream's resolved query, delivering matching records to the
/// callback. Returns how the scan ended; I/O errors stop it at the last
/// delivered rowid.
fn scan_stream(
    topic: &Topic,
    stream: &str,
    cond: &MatchCond,
    resolved: &ResolvedQuery,
    on_record: &mut RecordCallback<'_>,
) -> CoreResult<ScanControl> {
    let mut cursor = Cursor::new(&resolved.segments, resolved.span, cond.backward);
    while let Some((seg_idx, rowid)) = cursor.next_position() {
        let segment = &resolved.segments[seg_idx];
        let mut meta = topic.read_meta(stream, segment, rowid)?;

        if !record_matches(cond, resolved.time, &meta) {
            continue;
        }

        let payload = if cond.only_md {
            None
        } else {
            Some(topic.read_payload(stream, &segment.id, &meta)?)
        };
        meta.set_system_flag(meta.system_flag() | SYS_FLAG_LOADED_FROM_DISK);

        if on_record(stream, rowid, &meta, payload.as_ref()) == ScanControl::Stop {
            return Ok(ScanControl::Stop);
        }
    }
    Ok(ScanControl::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::RecordMeta;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    // 2024-03-01..03, 12:00 UTC
    const DAY1: u64 = 1_709_294_400;
    const DAY2: u64 = 1_709_380_800;
    const DAY3: u64 = 1_709_467_200;

    fn open_master(path: &Path) -> Database {
        Database::open(path, Config::new().master(true)).unwrap()
    }

    fn events_topic(db: &Database) -> Arc<Topic> {
        db.create_topic(TopicSpec::new("events").pkey("device"))
            .unwrap()
    }

    /// Appends `n` records for device d1: a third on each of three days.
    fn fill(db: &Database, n: u64) {
        let per_day = n.div_ceil(3);
        for i in 0..n {
            let t = match i / per_day {
                0 => DAY1 + i,
                1 => DAY2 + i,
                _ => DAY3 + i,
            };
            db.append_record("events", t, 0, json!({"device": "d1", "n": i}))
                .unwrap();
        }
    }

    fn collect_rowids(db: &Database, cond: MatchCond) -> (Vec<Rowid>, u64) {
        let mut rowids = Vec::new();
        let mut on_record = |_: &str, rowid: Rowid, _: &RecordMeta, _: Option<&Value>| {
            rowids.push(rowid);
            ScanControl::Continue
        };
        let it = db
            .open_iterator("events", "d1", Some("collector"), cond, Some(&mut on_record))
            .unwrap();
        let total = it.total_rows();
        db.close_iterator(it).unwrap();
        (rowids, total)
    }

    #[test]
    fn second_master_fails_fast_reader_does_not() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);

        let second = Database::open(temp.path(), Config::new().master(true));
        assert!(matches!(second, Err(CoreError::LockHeld)));

        // Recoverable by retrying read-only
        let reader = Database::open(temp.path(), Config::new()).unwrap();
        assert!(!reader.is_master());
        let result = reader.append_record("events", DAY1, 0, json!({"device": "d1"}));
        assert!(matches!(result, Err(CoreError::NotMaster { .. })));
    }

    #[test]
    fn create_topic_is_idempotent() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());

        events_topic(&db);
        db.append_record("events", DAY1, 0, json!({"device": "d1"}))
            .unwrap();

        // Reopening must not recreate files or lose data
        let topic = events_topic(&db);
        assert_eq!(topic.total_rows(), 1);

        // Open-only spec works too
        let topic = db.create_topic(TopicSpec::new("events")).unwrap();
        assert_eq!(topic.desc().pkey, "device");
    }

    #[test]
    fn reopen_with_other_shape_is_schema_conflict() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);

        let result = db.create_topic(TopicSpec::new("events").pkey("other"));
        assert!(matches!(result, Err(CoreError::SchemaConflict { .. })));

        let result = db.create_topic(
            TopicSpec::new("events")
                .pkey("device")
                .key_type(KeyType::Integer),
        );
        assert!(matches!(result, Err(CoreError::SchemaConflict { .. })));
    }

    #[test]
    fn rowids_are_sequential_across_failed_appends() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);

        for n in 1..=3u64 {
            let event = db
                .append_record("events", DAY1, 0, json!({"device": "d1"}))
                .unwrap();
            assert_eq!(event.rowid, n);
        }

        // A rejected append consumes nothing
        assert!(db
            .append_record("events", DAY1, 0, json!({"no_key": true}))
            .is_err());

        let event = db
            .append_record("events", DAY1, 0, json!({"device": "d1"}))
            .unwrap();
        assert_eq!(event.rowid, 4);
    }

    #[test]
    fn range_normalization_examples() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 100);

        let (rowids, total) = collect_rowids(&db, MatchCond::new().from_rowid(0).to_rowid(10));
        assert_eq!(total, 100);
        assert_eq!(rowids, (1..=10).collect::<Vec<_>>());

        let (rowids, _) = collect_rowids(&db, MatchCond::new().from_rowid(-10).to_rowid(0));
        assert_eq!(rowids, (91..=100).collect::<Vec<_>>());

        let (rowids, total) = collect_rowids(&db, MatchCond::new().from_rowid(10).to_rowid(9));
        assert_eq!(total, 100);
        assert!(rowids.is_empty());

        let (rowids, _) = collect_rowids(&db, MatchCond::new().from_rowid(-10).to_rowid(-20));
        assert!(rowids.is_empty());
    }

    #[test]
    fn backward_delivery_reverses_order_only() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 30);

        let mut times = Vec::new();
        let mut rowids = Vec::new();
        let mut on_record = |_: &str, rowid: Rowid, meta: &RecordMeta, _: Option<&Value>| {
            rowids.push(rowid);
            times.push(meta.t());
            ScanControl::Continue
        };
        let it = db
            .open_iterator(
                "events",
                "d1",
                None,
                MatchCond::new().from_rowid(1).to_rowid(10).backward(true),
                Some(&mut on_record),
            )
            .unwrap();
        db.close_iterator(it).unwrap();

        assert_eq!(rowids, (1..=10).rev().collect::<Vec<_>>());
        assert!(times.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn iterator_segments_are_contiguous() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 30);

        let it = db
            .open_iterator("events", "d1", None, MatchCond::new(), None)
            .unwrap();
        assert!(it.segments.len() >= 3);
        for pair in it.segments.windows(2) {
            assert_eq!(pair[1].first_row, pair[0].last_row + 1);
        }
        db.close_iterator(it).unwrap();
    }

    #[test]
    fn pagination_math_and_short_last_page() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 90);

        let it = db
            .open_iterator("events", "d1", None, MatchCond::new(), None)
            .unwrap();

        let page = db.get_page(&it, 1, 41, false).unwrap();
        assert_eq!(page.total_rows, 90);
        assert_eq!(page.pages, 3);
        assert_eq!(page.records.len(), 41);
        assert_eq!(page.records[0].rowid, 1);
        assert_eq!(page.records[40].rowid, 41);

        // Last page holds the remainder, not a full page
        let page = db.get_page(&it, 83, 41, false).unwrap();
        assert_eq!(page.records.len(), 8);
        assert_eq!(page.records.last().unwrap().rowid, 90);

        // Backward pages deliver descending
        let page = db.get_page(&it, 1, 10, true).unwrap();
        let rowids: Vec<Rowid> = page.records.iter().map(|r| r.rowid).collect();
        assert_eq!(rowids, (1..=10).rev().collect::<Vec<_>>());

        // Invalid from yields an empty page, not an error
        let page = db.get_page(&it, 0, 41, false).unwrap();
        assert_eq!(page.pages, 0);
        assert!(page.records.is_empty());
        let page = db.get_page(&it, 91, 41, false).unwrap();
        assert!(page.records.is_empty());

        db.close_iterator(it).unwrap();
    }

    #[test]
    fn only_md_skips_payload_decode() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 3);

        let mut payloads = Vec::new();
        let mut on_record = |_: &str, _: Rowid, _: &RecordMeta, payload: Option<&Value>| {
            payloads.push(payload.cloned());
            ScanControl::Continue
        };
        let it = db
            .open_iterator(
                "events",
                "d1",
                None,
                MatchCond::new().only_md(true),
                Some(&mut on_record),
            )
            .unwrap();
        db.close_iterator(it).unwrap();

        assert_eq!(payloads.len(), 3);
        assert!(payloads.iter().all(Option::is_none));
    }

    #[test]
    fn callback_stop_ends_scan() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 10);

        let mut seen = 0;
        let mut on_record = |_: &str, _: Rowid, _: &RecordMeta, _: Option<&Value>| {
            seen += 1;
            if seen == 4 {
                ScanControl::Stop
            } else {
                ScanControl::Continue
            }
        };
        let it = db
            .open_iterator("events", "d1", None, MatchCond::new(), Some(&mut on_record))
            .unwrap();
        db.close_iterator(it).unwrap();
        assert_eq!(seen, 4);
    }

    #[test]
    fn realtime_iterator_receives_appends_in_order() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 5);

        let it = db
            .open_iterator("events", "d1", None, MatchCond::new(), None)
            .unwrap();
        assert!(it.is_realtime());

        db.append_record("events", DAY3, 0, json!({"device": "d1", "live": 1}))
            .unwrap();
        db.append_record("events", DAY3, 0, json!({"device": "d1", "live": 2}))
            .unwrap();
        // Another key's appends are filtered out
        db.append_record("events", DAY3, 0, json!({"device": "d2", "live": 3}))
            .unwrap();

        let first = it.recv_event_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(first.rowid, 6);
        assert_eq!(first.payload["live"], json!(1));
        let second = it.poll_event().unwrap();
        assert_eq!(second.rowid, 7);
        assert!(it.poll_event().is_none());

        db.close_iterator(it).unwrap();
    }

    #[test]
    fn bounded_iterator_is_not_realtime() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 5);

        let it = db
            .open_iterator(
                "events",
                "d1",
                None,
                MatchCond::new().to_rowid(5),
                None,
            )
            .unwrap();
        assert!(!it.is_realtime());
        db.close_iterator(it).unwrap();
    }

    #[test]
    fn unknown_key_yields_empty_iterator() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 5);

        let it = db
            .open_iterator("events", "nope", None, MatchCond::new(), None)
            .unwrap();
        assert_eq!(it.total_rows(), 0);
        db.close_iterator(it).unwrap();
    }

    #[test]
    fn duplicate_iterator_id_rejected() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);

        let it = db
            .open_iterator("events", "d1", Some("watcher"), MatchCond::new(), None)
            .unwrap();
        let result = db.open_iterator("events", "d1", Some("watcher"), MatchCond::new(), None);
        assert!(matches!(result, Err(CoreError::IteratorExists { .. })));
        db.close_iterator(it).unwrap();
    }

    #[test]
    fn shutdown_refuses_while_iterators_open() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 2);

        let it = db
            .open_iterator("events", "d1", None, MatchCond::new(), None)
            .unwrap();
        assert!(matches!(
            db.shutdown(),
            Err(CoreError::IteratorsOpen { .. })
        ));

        db.close_iterator(it).unwrap();
        db.shutdown().unwrap();
    }

    #[test]
    fn user_flag_masks_filter_scan() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);

        db.append_record("events", DAY1, 0x0001, json!({"device": "d1"}))
            .unwrap();
        db.append_record("events", DAY1, 0x0000, json!({"device": "d1"}))
            .unwrap();
        db.append_record("events", DAY1, 0x0001, json!({"device": "d1"}))
            .unwrap();

        let (rowids, _) = collect_rowids(&db, MatchCond::new().user_flag_set(0x0001));
        assert_eq!(rowids, vec![1, 3]);

        // Clearing the bit makes the record invisible to the mask scan
        db.set_user_flag("events", "d1", 3, 0x0001, false).unwrap();
        let (rowids, _) = collect_rowids(&db, MatchCond::new().user_flag_set(0x0001));
        assert_eq!(rowids, vec![1]);
    }

    #[test]
    fn time_range_query_uses_segment_bounds() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 30); // ten records on each of three days

        let mut times = Vec::new();
        let mut on_record = |_: &str, _: Rowid, meta: &RecordMeta, _: Option<&Value>| {
            times.push(meta.t());
            ScanControl::Continue
        };
        let it = db
            .open_iterator(
                "events",
                "d1",
                None,
                MatchCond::new().from_t(DAY2).to_t(DAY3 - 1),
                Some(&mut on_record),
            )
            .unwrap();
        db.close_iterator(it).unwrap();

        assert_eq!(times.len(), 10);
        assert!(times.iter().all(|t| (DAY2..DAY3).contains(t)));
    }

    #[test]
    fn all_keys_scan_covers_every_stream() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);

        db.append_record("events", DAY1, 0, json!({"device": "a"}))
            .unwrap();
        db.append_record("events", DAY1, 0, json!({"device": "b"}))
            .unwrap();
        db.append_record("events", DAY1, 0, json!({"device": "a"}))
            .unwrap();

        let mut seen = Vec::new();
        let mut on_record = |key: &str, rowid: Rowid, _: &RecordMeta, _: Option<&Value>| {
            seen.push((key.to_string(), rowid));
            ScanControl::Continue
        };
        let it = db
            .open_iterator("events", "", None, MatchCond::new(), Some(&mut on_record))
            .unwrap();
        assert_eq!(it.total_rows(), 3);
        db.close_iterator(it).unwrap();

        assert_eq!(
            seen,
            vec![
                ("a".to_string(), 1),
                ("a".to_string(), 2),
                ("b".to_string(), 1),
            ]
        );
    }

    #[test]
    fn backup_topic_archives_and_resets() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 7);
        assert_eq!(db.topic_size("events").unwrap(), 7);

        db.backup_topic("events").unwrap();

        assert_eq!(db.topic_size("events").unwrap(), 0);
        assert!(temp.path().join("events.bak").exists());

        // The fresh topic keeps the descriptor and accepts appends from row 1
        let event = db
            .append_record("events", DAY1, 0, json!({"device": "d1"}))
            .unwrap();
        assert_eq!(event.rowid, 1);
    }

    #[test]
    fn read_record_by_rowid() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 5);

        let record = db.read_record("events", "d1", 3).unwrap();
        assert_eq!(record.rowid, 3);
        assert_eq!(record.payload["n"], json!(2));

        let missing = db.read_record("events", "d1", 99);
        assert!(matches!(missing, Err(CoreError::RecordNotFound { .. })));
    }

    #[test]
    fn reader_sees_master_appends_after_reopen_scan() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());
        events_topic(&db);
        fill(&db, 4);

        let reader = Database::open(temp.path(), Config::new()).unwrap();
        assert_eq!(reader.topic_key_size("events", "d1").unwrap(), 4);

        let record = reader.read_record("events", "d1", 4).unwrap();
        assert_eq!(record.payload["n"], json!(3));
    }

    #[test]
    fn topic_version_bump_resets_schema_and_vars() {
        let temp = tempdir().unwrap();
        let db = open_master(temp.path());

        db.create_topic(
            TopicSpec::new("events")
                .pkey("device")
                .var("threshold", json!(5))
                .topic_version(1),
        )
        .unwrap();

        // Same version: variables survive
        let topic = db
            .create_topic(TopicSpec::new("events").pkey("device").topic_version(1))
            .unwrap();
        assert_eq!(topic.var("threshold"), Some(json!(5)));

        // Newer version: variables replaced from the spec
        let topic = db
            .create_topic(
                TopicSpec::new("events")
                    .pkey("device")
                    .var("threshold", json!(9))
                    .topic_version(2),
            )
            .unwrap();
        assert_eq!(topic.var("threshold"), Some(json!(9)));
        assert_eq!(topic.var("topic_version"), Some(json!(2)));
    }
}
