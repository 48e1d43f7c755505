//! The persistent queue built on the record log.

use crate::msg::QueueMessage;
use chronolog_core::{
    CoreError, CoreResult, Database, KeyType, MatchCond, RecordMeta, Rowid, ScanControl,
    TopicSpec,
};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Persisted user-flag bit marking a message as not yet acknowledged.
pub const MSG_PENDING: u32 = 0x0001;

/// Topic variable holding the recovery checkpoint rowid.
const VAR_FIRST_ROWID: &str = "first_rowid";
/// Topic variable holding the backup threshold.
const VAR_BACKUP_QUEUE_SIZE: &str = "backup_queue_size";

/// A persistent message queue over one rowid-keyed topic.
///
/// Delivery is at-least-once: every appended message carries the persisted
/// pending bit, [`Queue::load`] replays still-pending messages after a
/// restart, and [`Queue::unload`] clears the bit exactly when the caller
/// reports durable delivery. Ack marks, timers and retry counters live only
/// in memory; a crash replays an ack-waiting message as plain pending.
pub struct Queue {
    db: Arc<Database>,
    topic_name: String,
    maximum_retries: u32,
    first_rowid: Rowid,
    messages: BTreeMap<Rowid, QueueMessage>,
}

impl Queue {
    /// Opens the queue, creating its topic if needed.
    ///
    /// The topic is forced to be rowid-keyed. When this process is master
    /// and `backup_queue_size` is non-zero, the threshold is persisted as a
    /// topic variable so later opens (and other tools) see it.
    ///
    /// # Errors
    ///
    /// Topic creation/open errors from the core engine.
    pub fn open(
        db: Arc<Database>,
        topic_name: &str,
        tkey: &str,
        backup_queue_size: u64,
    ) -> CoreResult<Self> {
        db.create_topic(
            TopicSpec::new(topic_name)
                .tkey(tkey)
                .key_type(KeyType::Rowid),
        )?;

        if backup_queue_size > 0 && db.is_master() {
            let mut patch = Map::new();
            patch.insert(VAR_BACKUP_QUEUE_SIZE.to_string(), json!(backup_queue_size));
            db.write_topic_var(topic_name, patch)?;
        }

        Ok(Self {
            db,
            topic_name: topic_name.to_string(),
            maximum_retries: 0,
            first_rowid: 0,
            messages: BTreeMap::new(),
        })
    }

    /// The queue's topic name.
    #[must_use]
    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    /// The underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Messages currently in the active list.
    #[must_use]
    pub fn size(&self) -> usize {
        self.messages.len()
    }

    /// Whether the active list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The recovery checkpoint as of the last load/append cycle.
    #[must_use]
    pub fn first_rowid(&self) -> Rowid {
        self.first_rowid
    }

    /// Iterates the active list in rowid order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueMessage> {
        self.messages.values()
    }

    /// The oldest active message.
    #[must_use]
    pub fn first(&self) -> Option<&QueueMessage> {
        self.messages.values().next()
    }

    /// The newest active message.
    #[must_use]
    pub fn last(&self) -> Option<&QueueMessage> {
        self.messages.values().next_back()
    }

    /// Looks up an active message by rowid.
    #[must_use]
    pub fn get(&self, rowid: Rowid) -> Option<&QueueMessage> {
        self.messages.get(&rowid)
    }

    /// Loads still-pending messages from disk into the active list.
    ///
    /// Scans from the persisted checkpoint (when one is set and still
    /// inside the topic) for records whose pending bit is set, metadata
    /// only. The checkpoint moves to the first pending rowid found — or to
    /// the topic's current size when nothing is pending, so the next load
    /// has no backlog to walk.
    ///
    /// # Errors
    ///
    /// Scan errors from the core engine.
    pub fn load(&mut self) -> CoreResult<usize> {
        self.messages.clear();

        let mut cond = MatchCond::new()
            .only_md(true)
            .user_flag_set(MSG_PENDING);

        let checkpoint = self.persisted_first_rowid();
        let topic_size = self.db.topic_size(&self.topic_name)?;
        if checkpoint > 0 && checkpoint <= topic_size {
            cond = cond.from_rowid(checkpoint as i64);
        }

        let mut found: Vec<(String, Rowid, RecordMeta)> = Vec::new();
        let mut on_record =
            |key: &str, rowid: Rowid, meta: &RecordMeta, _: Option<&Value>| -> ScanControl {
                found.push((key.to_string(), rowid, *meta));
                ScanControl::Continue
            };
        let it = self.db.open_iterator(
            &self.topic_name,
            "",
            Some("queue-load"),
            cond,
            Some(&mut on_record),
        )?;
        self.db.close_iterator(it)?;

        self.first_rowid = found.first().map_or(0, |(_, rowid, _)| *rowid);

        let loaded = found.len();
        for (key, rowid, meta) in found {
            self.messages.insert(rowid, QueueMessage::new(rowid, key, meta));
        }

        if self.first_rowid == 0 {
            // No backlog; start the next recovery at the current end.
            self.first_rowid = topic_size;
        }
        if self.first_rowid != 0 {
            self.set_first_rowid(self.first_rowid)?;
        }

        tracing::debug!(
            topic = %self.topic_name,
            loaded,
            checkpoint = self.first_rowid,
            "loaded pending messages"
        );
        Ok(loaded)
    }

    /// Appends a message with the pending bit set and adds it to the tail
    /// of the active list. `t == 0` means now.
    ///
    /// # Errors
    ///
    /// Append errors from the core engine.
    pub fn append(&mut self, t: u64, payload: Value) -> CoreResult<Rowid> {
        let event = self
            .db
            .append_record(&self.topic_name, t, MSG_PENDING, payload)?;
        let rowid = event.rowid;
        self.messages
            .insert(rowid, QueueMessage::new(rowid, event.key, event.meta));
        Ok(rowid)
    }

    /// Returns a message's payload, loading it from disk on first access.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when the rowid is not in the active list, or read
    /// errors from the core engine.
    pub fn payload(&mut self, rowid: Rowid) -> CoreResult<Value> {
        // Borrow-friendly: read from disk before mutating the entry.
        let needs_load = {
            let msg = self.message(rowid)?;
            msg.payload.is_none()
        };
        if needs_load {
            let key = self.message(rowid)?.key.clone();
            let record = self.db.read_record(&self.topic_name, &key, rowid)?;
            self.message_mut(rowid)?.payload = Some(record.payload);
        }
        Ok(self
            .message(rowid)?
            .payload
            .clone()
            .unwrap_or(Value::Null))
    }

    /// Removes a message after durable delivery: clears the persisted
    /// pending bit and drops it from the active list.
    ///
    /// Must be called exactly once per delivered message; the engine does
    /// not detect double unloads.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when the rowid is not in the active list.
    pub fn unload(&mut self, rowid: Rowid, result: i32) -> CoreResult<()> {
        self.set_hard_flag(rowid, MSG_PENDING, false)?;
        self.messages.remove(&rowid);
        tracing::debug!(topic = %self.topic_name, rowid, result, "unloaded message");
        Ok(())
    }

    /// Sets or clears persisted user-flag bits on a message's record.
    ///
    /// This is the durable half of the bookkeeping: the pending bit set
    /// here survives a restart and drives the next [`Queue::load`].
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when the rowid is not in the active list.
    pub fn set_hard_flag(&mut self, rowid: Rowid, mask: u32, on: bool) -> CoreResult<()> {
        let key = self.message(rowid)?.key.clone();
        self.db
            .set_user_flag(&self.topic_name, &key, rowid, mask, on)?;
        let msg = self.message_mut(rowid)?;
        msg.meta.apply_user_mask(mask, on);
        Ok(())
    }

    /// Sets or clears in-memory soft-mark bits, returning the new mask.
    ///
    /// Soft marks are never persisted; a crashed ack-pending message is
    /// replayed as plain pending.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when the rowid is not in the active list.
    pub fn set_soft_mark(&mut self, rowid: Rowid, mask: u64, on: bool) -> CoreResult<u64> {
        let msg = self.message_mut(rowid)?;
        if on {
            msg.soft_mark |= mask;
        } else {
            msg.soft_mark &= !mask;
        }
        Ok(msg.soft_mark)
    }

    /// Arms the in-memory ack timer of a message.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when the rowid is not in the active list.
    pub fn set_ack_timer(&mut self, rowid: Rowid, timeout: Duration) -> CoreResult<()> {
        self.message_mut(rowid)?.arm_ack_timer(timeout);
        Ok(())
    }

    /// Clears the ack timer of a message.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when the rowid is not in the active list.
    pub fn clear_ack_timer(&mut self, rowid: Rowid) -> CoreResult<()> {
        self.message_mut(rowid)?.clear_ack_timer();
        Ok(())
    }

    /// Sets the retry ceiling used by [`Queue::retries_exceeded`];
    /// zero disables the check.
    pub fn set_maximum_retries(&mut self, maximum: u32) {
        self.maximum_retries = maximum;
    }

    /// Adds delivery attempts to a message's retry counter.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when the rowid is not in the active list.
    pub fn add_retries(&mut self, rowid: Rowid, count: u32) -> CoreResult<()> {
        let msg = self.message_mut(rowid)?;
        msg.retries += count;
        Ok(())
    }

    /// Resets a message's retry counter.
    ///
    /// # Errors
    ///
    /// `RecordNotFound` when the rowid is not in the active list.
    pub fn clear_retries(&mut self, rowid: Rowid) -> CoreResult<()> {
        self.message_mut(rowid)?.retries = 0;
        Ok(())
    }

    /// Whether a message's retries reached the configured ceiling.
    #[must_use]
    pub fn retries_exceeded(&self, rowid: Rowid) -> bool {
        if self.maximum_retries == 0 {
            return false;
        }
        self.messages
            .get(&rowid)
            .is_some_and(|msg| msg.retries >= self.maximum_retries)
    }

    /// Archives the topic when it grew past the configured threshold.
    ///
    /// When `topic size >= backup_queue_size`, the topic's contents move to
    /// the backup directory and a fresh empty topic takes their place; the
    /// checkpoint resets to zero so the next [`Queue::load`] starts clean.
    /// Returns whether a backup happened.
    ///
    /// # Errors
    ///
    /// Backup errors from the core engine.
    pub fn check_backup(&mut self) -> CoreResult<bool> {
        let threshold = self
            .db
            .topic(&self.topic_name)?
            .var(VAR_BACKUP_QUEUE_SIZE)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if threshold == 0 {
            return Ok(false);
        }

        let size = self.db.topic_size(&self.topic_name)?;
        if size < threshold {
            return Ok(false);
        }

        // Record where the archive ended, then start the fresh topic at 0.
        self.set_first_rowid(size)?;
        self.db.backup_topic(&self.topic_name)?;

        // The fresh topic starts with empty variables; carry the threshold.
        let mut patch = Map::new();
        patch.insert(VAR_BACKUP_QUEUE_SIZE.to_string(), json!(threshold));
        self.db.write_topic_var(&self.topic_name, patch)?;
        self.set_first_rowid(0)?;
        tracing::info!(topic = %self.topic_name, archived_rows = size, "rotated queue topic");
        Ok(true)
    }

    /// Moves the recovery checkpoint, persisting it when master.
    ///
    /// # Errors
    ///
    /// Topic-variable write errors from the core engine.
    pub fn set_first_rowid(&mut self, rowid: Rowid) -> CoreResult<()> {
        self.first_rowid = rowid;
        if self.db.is_master() {
            let mut patch = Map::new();
            patch.insert(VAR_FIRST_ROWID.to_string(), json!(rowid));
            self.db.write_topic_var(&self.topic_name, patch)?;
        }
        Ok(())
    }

    fn persisted_first_rowid(&self) -> Rowid {
        self.db
            .topic(&self.topic_name)
            .ok()
            .and_then(|topic| topic.var(VAR_FIRST_ROWID))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    fn message(&self, rowid: Rowid) -> CoreResult<&QueueMessage> {
        self.messages
            .get(&rowid)
            .ok_or_else(|| self.not_found(rowid))
    }

    fn message_mut(&mut self, rowid: Rowid) -> CoreResult<&mut QueueMessage> {
        if !self.messages.contains_key(&rowid) {
            return Err(self.not_found(rowid));
        }
        Ok(self.messages.get_mut(&rowid).expect("checked above"))
    }

    fn not_found(&self, rowid: Rowid) -> CoreError {
        CoreError::RecordNotFound {
            topic: self.topic_name.clone(),
            key: String::new(),
            rowid,
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("topic", &self.topic_name)
            .field("active", &self.messages.len())
            .field("first_rowid", &self.first_rowid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronolog_core::Config;
    use tempfile::tempdir;

    fn open_db(path: &std::path::Path) -> Arc<Database> {
        Arc::new(Database::open(path, Config::new().master(true)).unwrap())
    }

    fn open_queue(db: &Arc<Database>) -> Queue {
        Queue::open(Arc::clone(db), "jobs", "", 0).unwrap()
    }

    #[test]
    fn append_inserts_at_tail() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());
        let mut queue = open_queue(&db);

        let first = queue.append(0, json!({"job": "a"})).unwrap();
        let second = queue.append(0, json!({"job": "b"})).unwrap();

        assert_eq!((first, second), (1, 2));
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.first().unwrap().rowid(), 1);
        assert_eq!(queue.last().unwrap().rowid(), 2);
    }

    #[test]
    fn appended_messages_carry_the_pending_bit() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());
        let mut queue = open_queue(&db);

        let rowid = queue.append(0, json!({"job": "a"})).unwrap();
        let flag = db.read_user_flag("jobs", "", rowid).unwrap();
        assert_eq!(flag & MSG_PENDING, MSG_PENDING);
    }

    #[test]
    fn load_after_restart_replays_pending_only() {
        let temp = tempdir().unwrap();
        {
            let db = open_db(temp.path());
            let mut queue = open_queue(&db);
            queue.append(0, json!({"job": "a"})).unwrap();
            queue.append(0, json!({"job": "b"})).unwrap();
            queue.append(0, json!({"job": "c"})).unwrap();
            queue.unload(2, 0).unwrap();
            db.shutdown().unwrap();
        }

        // Simulated restart
        let db = open_db(temp.path());
        let mut queue = open_queue(&db);
        let loaded = queue.load().unwrap();

        assert_eq!(loaded, 2);
        let rowids: Vec<Rowid> = queue.iter().map(QueueMessage::rowid).collect();
        assert_eq!(rowids, vec![1, 3]);
        // Checkpoint points at the first pending message
        assert_eq!(queue.first_rowid(), 1);
    }

    #[test]
    fn unload_is_durable_across_reloads() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());
        let mut queue = open_queue(&db);

        queue.append(0, json!({"job": "a"})).unwrap();
        queue.unload(1, 0).unwrap();
        assert!(queue.is_empty());

        // A second load never returns an unloaded message
        assert_eq!(queue.load().unwrap(), 0);
        // With nothing pending the checkpoint jumps to the end
        assert_eq!(queue.first_rowid(), 1);
    }

    #[test]
    fn payload_loads_lazily() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());
        let mut queue = open_queue(&db);

        queue.append(0, json!({"job": "a", "n": 7})).unwrap();
        queue.load().unwrap();

        assert!(queue.get(1).unwrap().payload.is_none());
        let payload = queue.payload(1).unwrap();
        assert_eq!(payload["n"], json!(7));
        // Cached after first read
        assert!(queue.get(1).unwrap().payload.is_some());
    }

    #[test]
    fn soft_marks_are_memory_only() {
        let temp = tempdir().unwrap();
        {
            let db = open_db(temp.path());
            let mut queue = open_queue(&db);
            queue.append(0, json!({"job": "a"})).unwrap();
            assert_eq!(queue.set_soft_mark(1, 0x2, true).unwrap(), 0x2);
            assert_eq!(queue.get(1).unwrap().soft_mark(), 0x2);
            db.shutdown().unwrap();
        }

        let db = open_db(temp.path());
        let mut queue = open_queue(&db);
        queue.load().unwrap();
        // Replayed as plain pending, never as ack-pending
        assert_eq!(queue.get(1).unwrap().soft_mark(), 0);
    }

    #[test]
    fn retry_bookkeeping() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());
        let mut queue = open_queue(&db);
        queue.append(0, json!({"job": "a"})).unwrap();

        // No ceiling configured: never exceeded
        queue.add_retries(1, 5).unwrap();
        assert!(!queue.retries_exceeded(1));

        queue.set_maximum_retries(3);
        assert!(queue.retries_exceeded(1));

        queue.clear_retries(1).unwrap();
        assert!(!queue.retries_exceeded(1));
    }

    #[test]
    fn ack_timer_round_trip() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());
        let mut queue = open_queue(&db);
        queue.append(0, json!({"job": "a"})).unwrap();

        queue.set_ack_timer(1, Duration::ZERO).unwrap();
        assert!(queue.get(1).unwrap().ack_timer_expired());

        queue.clear_ack_timer(1).unwrap();
        assert!(!queue.get(1).unwrap().ack_timer_expired());
    }

    #[test]
    fn backup_rotation_resets_checkpoint() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());
        let mut queue = Queue::open(Arc::clone(&db), "jobs", "", 5).unwrap();

        for n in 0..5 {
            queue.append(0, json!({"job": n})).unwrap();
        }
        assert!(queue.check_backup().unwrap());

        // The topic starts over and the checkpoint is zero
        assert_eq!(db.topic_size("jobs").unwrap(), 0);
        assert_eq!(queue.first_rowid(), 0);
        assert!(temp.path().join("jobs.bak").exists());

        // The next load starts clean
        let mut fresh = Queue::open(Arc::clone(&db), "jobs", "", 5).unwrap();
        assert_eq!(fresh.load().unwrap(), 0);

        // The threshold survives the rotation
        for n in 0..5 {
            queue.append(0, json!({"job": n})).unwrap();
        }
        assert!(queue.check_backup().unwrap());
    }

    #[test]
    fn below_threshold_does_not_rotate() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());
        let mut queue = Queue::open(Arc::clone(&db), "jobs", "", 10).unwrap();

        queue.append(0, json!({"job": 1})).unwrap();
        assert!(!queue.check_backup().unwrap());
        assert_eq!(db.topic_size("jobs").unwrap(), 1);
    }

    #[test]
    fn operations_on_unknown_rowid_fail() {
        let temp = tempdir().unwrap();
        let db = open_db(temp.path());
        let mut queue = open_queue(&db);

        assert!(matches!(
            queue.unload(99, 0),
            Err(CoreError::RecordNotFound { .. })
        ));
        assert!(matches!(
            queue.set_soft_mark(99, 1, true),
            Err(CoreError::RecordNotFound { .. })
        ));
    }

    #[test]
    fn checkpoint_skips_drained_history() {
        let temp = tempdir().unwrap();
        {
            let db = open_db(temp.path());
            let mut queue = open_queue(&db);
            for n in 0..4 {
                queue.append(0, json!({"job": n})).unwrap();
            }
            for rowid in 1..=4 {
                queue.unload(rowid, 0).unwrap();
            }
            queue.load().unwrap();
            // Everything drained: checkpoint advanced to the topic end
            assert_eq!(queue.first_rowid(), 4);
            db.shutdown().unwrap();
        }

        let db = open_db(temp.path());
        let mut queue = open_queue(&db);
        queue.append(0, json!({"job": "new"})).unwrap();
        queue.load().unwrap();
        // Only the new message comes back, scanned from the checkpoint
        let rowids: Vec<Rowid> = queue.iter().map(QueueMessage::rowid).collect();
        assert_eq!(rowids, vec![5]);
    }
}
