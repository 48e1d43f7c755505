//! Iterator and query engine: range normalization, cursor walking,
//! pagination.
//!
//! Queries are described by a [`MatchCond`] and resolved in two steps:
//! normalize the requested rowid/time ranges against the key's totals, then
//! ask the segment catalog for the segments intersecting the normalized
//! span. Scanning walks that span row by row through an explicit cursor
//! state machine; direction only changes delivery order, never the span.

use crate::feed::{RecordEvent, SubscriptionId};
use crate::meta::RecordMeta;
use crate::segment::{locate_segment, KeyCache, KeyTotals, SegmentInfo};
use crate::types::Rowid;
use serde_json::Value;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// Per-record callback invoked synchronously during a scan with
/// `(key, rowid, metadata, payload)`. The payload is `None` for
/// metadata-only scans. The return value may stop the scan.
pub type RecordCallback<'a> = dyn FnMut(&str, Rowid, &RecordMeta, Option<&Value>) -> ScanControl + 'a;

/// Query descriptor for opening an iterator.
///
/// Rowid bounds are signed: `0` means unset, negative values are relative to
/// the end of the stream (`-1` is the last row). Time bounds of `0` mean
/// unset. A cond with no upper bound at all (`to_rowid == 0 && to_t == 0`)
/// asks for realtime tailing after the stored rows are exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchCond {
    /// Deliver in descending rowid order.
    pub backward: bool,
    /// First rowid, absolute when positive, relative to end when negative.
    pub from_rowid: i64,
    /// Last rowid, absolute when positive, relative to end when negative.
    pub to_rowid: i64,
    /// Lowest wall-clock time to deliver.
    pub from_t: u64,
    /// Highest wall-clock time to deliver.
    pub to_t: u64,
    /// Deliver metadata only; payloads are not decoded.
    pub only_md: bool,
    /// Deliver only records whose user flag has all these bits set.
    pub user_flag_set_mask: u32,
    /// Deliver only records whose user flag has none of these bits.
    pub user_flag_unset_mask: u32,
}

impl MatchCond {
    /// Creates an unbounded forward condition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets descending delivery order.
    #[must_use]
    pub fn backward(mut self, value: bool) -> Self {
        self.backward = value;
        self
    }

    /// Sets the first rowid (absolute when positive, relative when negative).
    #[must_use]
    pub fn from_rowid(mut self, value: i64) -> Self {
        self.from_rowid = value;
        self
    }

    /// Sets the last rowid (absolute when positive, relative when negative).
    #[must_use]
    pub fn to_rowid(mut self, value: i64) -> Self {
        self.to_rowid = value;
        self
    }

    /// Sets the lowest wall-clock time to deliver.
    #[must_use]
    pub fn from_t(mut self, value: u64) -> Self {
        self.from_t = value;
        self
    }

    /// Sets the highest wall-clock time to deliver.
    #[must_use]
    pub fn to_t(mut self, value: u64) -> Self {
        self.to_t = value;
        self
    }

    /// Requests metadata-only delivery.
    #[must_use]
    pub fn only_md(mut self, value: bool) -> Self {
        self.only_md = value;
        self
    }

    /// Requires all bits of `mask` set in the record user flag.
    #[must_use]
    pub fn user_flag_set(mut self, mask: u32) -> Self {
        self.user_flag_set_mask = mask;
        self
    }

    /// Requires no bit of `mask` set in the record user flag.
    #[must_use]
    pub fn user_flag_unset(mut self, mask: u32) -> Self {
        self.user_flag_unset_mask = mask;
        self
    }

    /// Whether the condition asks for realtime tailing: no upper bound was
    /// given, so the iterator keeps receiving appends after the stored rows.
    #[must_use]
    pub fn wants_realtime(&self) -> bool {
        self.to_rowid == 0 && self.to_t == 0
    }

    /// Whether a record's flags pass the user-flag masks.
    #[must_use]
    pub fn flags_match(&self, meta: &RecordMeta) -> bool {
        let flag = meta.user_flag();
        (flag & self.user_flag_set_mask) == self.user_flag_set_mask
            && (flag & self.user_flag_unset_mask) == 0
    }
}

/// Normalizes a signed rowid range against a stream of `total` rows.
///
/// Policy:
/// - `from == 0` starts at row 1; positive `from` beyond the end is empty;
///   negative `from` counts from the end (`total + from + 1`) and clamps to 1
/// - `to == 0` or beyond the end stops at `total`; negative `to` counts from
///   the end (`total + to`) and is empty when that lands before row 1
/// - an inverted range after normalization is empty
///
/// Empty is a valid result (`None`), not an error.
#[must_use]
pub fn normalize_rowid_range(from: i64, to: i64, total: u64) -> Option<(Rowid, Rowid)> {
    if total == 0 {
        return None;
    }
    let total_i = i64::try_from(total).ok()?;

    let from = if from == 0 {
        1
    } else if from > 0 {
        if from > total_i {
            return None;
        }
        from
    } else if from < -total_i {
        1
    } else {
        total_i + from + 1
    };

    let to = if to == 0 {
        total_i
    } else if to > 0 {
        to.min(total_i)
    } else {
        let to = total_i + to;
        if to < 1 {
            return None;
        }
        to
    };

    if from > to {
        return None;
    }
    Some((from as Rowid, to as Rowid))
}

/// Normalizes a time window against a key's totals: zero bounds open up to
/// the stream's extremes, bounds outside the stored window either clamp or
/// make the range empty.
#[must_use]
pub fn normalize_time_range(from_t: u64, to_t: u64, totals: &KeyTotals) -> Option<(u64, u64)> {
    if totals.rows == 0 {
        return None;
    }

    let from = if from_t == 0 {
        totals.fr_t
    } else if from_t > totals.to_t {
        return None;
    } else {
        from_t.max(totals.fr_t)
    };

    let to = if to_t == 0 {
        totals.to_t
    } else if to_t < totals.fr_t {
        return None;
    } else {
        to_t.min(totals.to_t)
    };

    Some((from, to))
}

/// A query resolved against a key's segment catalog.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedQuery {
    /// Segments intersecting the span, ascending.
    pub segments: Vec<SegmentInfo>,
    /// Normalized inclusive rowid span; `None` when the range is empty.
    pub span: Option<(Rowid, Rowid)>,
    /// Normalized time window, when the cond carried one.
    pub time: Option<(u64, u64)>,
    /// Total rows of the key at resolution time.
    pub total_rows: u64,
}

impl ResolvedQuery {
    fn empty(total_rows: u64) -> Self {
        Self {
            segments: Vec::new(),
            span: None,
            time: None,
            total_rows,
        }
    }
}

/// Resolves a condition against a key's catalog.
pub(crate) fn resolve_query(cache: &KeyCache, cond: &MatchCond) -> ResolvedQuery {
    let total = cache.total_rows();

    let Some((mut from, mut to)) = normalize_rowid_range(cond.from_rowid, cond.to_rowid, total)
    else {
        return ResolvedQuery::empty(total);
    };

    let mut time = None;
    if cond.from_t != 0 || cond.to_t != 0 {
        let Some((ft, tt)) = normalize_time_range(cond.from_t, cond.to_t, &cache.totals()) else {
            return ResolvedQuery::empty(total);
        };
        let Some((f, t)) = cache.clamp_rows_by_time(from, to, ft, tt) else {
            return ResolvedQuery::empty(total);
        };
        from = f;
        to = t;
        time = Some((ft, tt));
    }

    ResolvedQuery {
        segments: cache.resolve_rows(from, to),
        span: Some((from, to)),
        time,
        total_rows: total,
    }
}

/// What a record callback tells the scan to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    /// Keep scanning.
    Continue,
    /// Stop the scan after this record.
    Stop,
}

/// Explicit cursor state machine over a resolved segment list.
///
/// The cursor yields `(segment index, rowid)` positions, ascending or
/// descending, strictly inside the resolved span. Segment hops check the
/// contiguity invariant.
#[derive(Debug)]
pub(crate) struct Cursor<'a> {
    segments: &'a [SegmentInfo],
    from: Rowid,
    to: Rowid,
    backward: bool,
    state: CursorState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Start,
    At { seg: usize, rowid: Rowid },
    Done,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(
        segments: &'a [SegmentInfo],
        span: Option<(Rowid, Rowid)>,
        backward: bool,
    ) -> Self {
        let (from, to) = span.unwrap_or((1, 0));
        Self {
            segments,
            from,
            to,
            backward,
            state: if span.is_none() {
                CursorState::Done
            } else {
                CursorState::Start
            },
        }
    }

    /// Advances the cursor, returning the next position in scan order.
    pub(crate) fn next_position(&mut self) -> Option<(usize, Rowid)> {
        match self.state {
            CursorState::Done => None,
            CursorState::Start => {
                let rowid = if self.backward { self.to } else { self.from };
                match locate_segment(self.segments, rowid) {
                    Some(seg) => {
                        self.state = CursorState::At { seg, rowid };
                        Some((seg, rowid))
                    }
                    None => {
                        self.state = CursorState::Done;
                        None
                    }
                }
            }
            CursorState::At { seg, rowid } => {
                let next = if self.backward {
                    rowid.checked_sub(1).filter(|r| *r >= self.from)
                } else {
                    Some(rowid + 1).filter(|r| *r <= self.to)
                };
                let Some(rowid) = next else {
                    self.state = CursorState::Done;
                    return None;
                };

                let seg = if self.segments[seg].contains(rowid) {
                    seg
                } else if self.backward {
                    // Hop to the previous segment; rowids stay consecutive.
                    match seg.checked_sub(1) {
                        Some(prev) if self.segments[prev].last_row == rowid => prev,
                        _ => {
                            self.state = CursorState::Done;
                            return None;
                        }
                    }
                } else {
                    match self.segments.get(seg + 1) {
                        Some(next_seg) if next_seg.first_row == rowid => seg + 1,
                        _ => {
                            self.state = CursorState::Done;
                            return None;
                        }
                    }
                };

                self.state = CursorState::At { seg, rowid };
                Some((seg, rowid))
            }
        }
    }
}

/// One page of records from [`crate::Database::get_page`].
#[derive(Debug, Clone)]
pub struct Page {
    /// Total rows visible to the iterator.
    pub total_rows: u64,
    /// Number of pages at the requested limit.
    pub pages: u64,
    /// The records of this page, in delivery order.
    pub records: Vec<RecordEvent>,
}

/// Number of pages needed for `total_rows` at `limit` rows per page.
///
/// The last page holds the remainder; callers must not assume full pages.
#[must_use]
pub fn compute_pages(total_rows: u64, limit: u64) -> u64 {
    if limit == 0 {
        return 0;
    }
    total_rows.div_ceil(limit)
}

/// An open iterator: a resolved, ordered view over one key stream, plus an
/// optional realtime tail.
///
/// Iterators are created by [`crate::Database::open_iterator`] and must be
/// closed with [`crate::Database::close_iterator`], which releases the
/// realtime subscription and the registered id.
#[derive(Debug)]
pub struct RecordIterator {
    pub(crate) id: String,
    pub(crate) topic_name: String,
    pub(crate) key: String,
    pub(crate) cond: MatchCond,
    pub(crate) segments: Vec<SegmentInfo>,
    pub(crate) span: Option<(Rowid, Rowid)>,
    pub(crate) time: Option<(u64, u64)>,
    pub(crate) total_rows: u64,
    pub(crate) realtime: Option<(SubscriptionId, Receiver<RecordEvent>)>,
}

impl RecordIterator {
    /// The iterator's id, unique within its topic.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The topic this iterator reads.
    #[must_use]
    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    /// The condition this iterator was opened with.
    #[must_use]
    pub fn cond(&self) -> &MatchCond {
        &self.cond
    }

    /// The normalized time window, when the condition carried one.
    #[must_use]
    pub fn time_window(&self) -> Option<(u64, u64)> {
        self.time
    }

    /// The key stream this iterator reads.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Total rows visible to this iterator (snapshot at open).
    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    /// Whether this iterator tails live appends.
    #[must_use]
    pub fn is_realtime(&self) -> bool {
        self.realtime.is_some()
    }

    /// Takes the next pending realtime event, if any.
    #[must_use]
    pub fn poll_event(&self) -> Option<RecordEvent> {
        self.realtime
            .as_ref()
            .and_then(|(_, rx)| rx.try_recv().ok())
    }

    /// Waits up to `timeout` for a realtime event.
    #[must_use]
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<RecordEvent> {
        self.realtime
            .as_ref()
            .and_then(|(_, rx)| rx.recv_timeout(timeout).ok())
    }

    /// Drains all pending realtime events.
    pub fn drain_events(&self) -> Vec<RecordEvent> {
        match &self.realtime {
            Some((_, rx)) => rx.try_iter().collect(),
            None => Vec::new(),
        }
    }
}

/// Convenience for scan implementations: whether a record passes the
/// per-record filters of a resolved query.
pub(crate) fn record_matches(
    cond: &MatchCond,
    time: Option<(u64, u64)>,
    meta: &RecordMeta,
) -> bool {
    if let Some((from_t, to_t)) = time {
        if meta.t() < from_t || meta.t() > to_t {
            return false;
        }
    }
    cond.flags_match(meta)
}
