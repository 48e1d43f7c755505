//! Segment catalog: per-key index of date-bounded segment files.
//!
//! Each key stream of a topic is stored as a series of segment files, one
//! per date bucket. The catalog is a pure in-memory index over those files,
//! rebuilt at topic-open time from a cheap scan (first and last metadata
//! entry of each index file, plus its length) and kept current by the append
//! path. It answers "which segments cover this rowid range" without touching
//! payload data.
//!
//! Invariant: segments of a key are ordered and contiguous —
//! `segment[i+1].first_row == segment[i].last_row + 1`.

use crate::dir::INDEX_EXT;
use crate::error::{CoreError, CoreResult};
use crate::meta::{RecordMeta, META_RECORD_SIZE};
use crate::types::Rowid;
use chronolog_storage::{FileBackend, StorageBackend};
use std::fs;
use std::path::Path;

/// Per-file statistics gathered from a segment's index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    /// Bucket id: the date-mask-derived file stem, e.g. `2024-03-01`.
    pub id: String,
    /// Smallest wall-clock time in the file.
    pub fr_t: u64,
    /// Largest wall-clock time in the file.
    pub to_t: u64,
    /// Smallest tie-break time in the file.
    pub fr_tm: u64,
    /// Largest tie-break time in the file.
    pub to_tm: u64,
    /// Number of records in the file.
    pub rows: u64,
}

/// Aggregated statistics over a whole key stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyTotals {
    /// Smallest wall-clock time of the stream.
    pub fr_t: u64,
    /// Largest wall-clock time of the stream.
    pub to_t: u64,
    /// Smallest tie-break time of the stream.
    pub fr_tm: u64,
    /// Largest tie-break time of the stream.
    pub to_tm: u64,
    /// Total records of the stream.
    pub rows: u64,
}

/// A segment resolved against a rowid range: file stats plus the global
/// rowids it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Bucket id of the segment file.
    pub id: String,
    /// First global rowid stored in the segment.
    pub first_row: Rowid,
    /// Last global rowid stored in the segment.
    pub last_row: Rowid,
    /// Smallest wall-clock time in the segment.
    pub fr_t: u64,
    /// Largest wall-clock time in the segment.
    pub to_t: u64,
    /// Number of records in the segment.
    pub rows: u64,
}

impl SegmentInfo {
    /// Whether the segment covers the given rowid.
    #[must_use]
    pub fn contains(&self, rowid: Rowid) -> bool {
        self.first_row <= rowid && rowid <= self.last_row
    }
}

/// In-memory catalog of one key stream's segment files.
#[derive(Debug, Clone, Default)]
pub struct KeyCache {
    files: Vec<SegmentStats>,
    total: KeyTotals,
}

impl KeyCache {
    /// Builds a catalog by scanning a key directory's index files.
    ///
    /// Only the first and last metadata entry of each file are read. Empty
    /// index files are skipped; a file whose length is not a whole number of
    /// entries is corruption.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` for malformed index files, or an I/O error.
    pub fn load(key_dir: &Path) -> CoreResult<Self> {
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(key_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(INDEX_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();

        let mut cache = Self::default();
        for name in names {
            let path = key_dir.join(format!("{name}.{INDEX_EXT}"));
            if let Some(stats) = load_segment_stats(&path, &name)? {
                cache.files.push(stats);
            }
        }
        cache.recompute_totals();
        Ok(cache)
    }

    /// The per-file statistics, ordered by bucket id.
    #[must_use]
    pub fn files(&self) -> &[SegmentStats] {
        &self.files
    }

    /// Aggregated totals over the stream.
    #[must_use]
    pub fn totals(&self) -> KeyTotals {
        self.total
    }

    /// Total records of the stream.
    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.total.rows
    }

    /// Records the metadata of a freshly appended record.
    ///
    /// Updates the last file's statistics when the bucket matches, otherwise
    /// starts a new segment entry. Returns the rowid assigned to the record.
    pub fn note_append(&mut self, bucket: &str, meta: &RecordMeta) -> Rowid {
        match self.files.last_mut() {
            Some(last) if last.id == bucket => {
                last.rows += 1;
                last.fr_t = last.fr_t.min(meta.t());
                last.to_t = last.to_t.max(meta.t());
                last.fr_tm = last.fr_tm.min(meta.tm());
                last.to_tm = last.to_tm.max(meta.tm());
            }
            _ => {
                self.files.push(SegmentStats {
                    id: bucket.to_string(),
                    fr_t: meta.t(),
                    to_t: meta.t(),
                    fr_tm: meta.tm(),
                    to_tm: meta.tm(),
                    rows: 1,
                });
            }
        }
        self.recompute_totals();
        self.total.rows
    }

    /// Resolves a normalized rowid range to the segments intersecting it.
    ///
    /// The returned list is ascending by rowid; first/last rows are the
    /// cumulative 1-based positions of each file in the stream. An empty
    /// list means the range touches no stored rows.
    #[must_use]
    pub fn resolve_rows(&self, from: Rowid, to: Rowid) -> Vec<SegmentInfo> {
        let mut segments = Vec::new();
        let mut next_first: Rowid = 1;

        for stats in &self.files {
            let first = next_first;
            let last = first + stats.rows - 1;
            next_first = last + 1;

            if first > to {
                break;
            }
            if last < from {
                continue;
            }
            segments.push(SegmentInfo {
                id: stats.id.clone(),
                first_row: first,
                last_row: last,
                fr_t: stats.fr_t,
                to_t: stats.to_t,
                rows: stats.rows,
            });
        }

        segments
    }

    /// Narrows a rowid span to rows whose segments may hold times inside
    /// `[from_t, to_t]`, using per-file time bounds.
    ///
    /// Segments are never dropped from the middle of a range (that would
    /// break rowid contiguity); the span is only clamped at both ends.
    /// Returns `None` when no segment overlaps the time window.
    #[must_use]
    pub fn clamp_rows_by_time(
        &self,
        from: Rowid,
        to: Rowid,
        from_t: u64,
        to_t: u64,
    ) -> Option<(Rowid, Rowid)> {
        let all = self.resolve_rows(1, self.total.rows.max(1));

        let first = all.iter().find(|s| s.to_t >= from_t)?;
        let last = all.iter().rev().find(|s| s.fr_t <= to_t)?;
        if first.first_row > last.last_row {
            return None;
        }

        let lo = from.max(first.first_row);
        let hi = to.min(last.last_row);
        if lo > hi {
            return None;
        }
        Some((lo, hi))
    }
}

impl KeyCache {
    fn recompute_totals(&mut self) {
        let mut total = KeyTotals::default();
        if let Some(first) = self.files.first() {
            total.fr_t = first.fr_t;
            total.fr_tm = first.fr_tm;
        }
        for stats in &self.files {
            total.fr_t = total.fr_t.min(stats.fr_t);
            total.to_t = total.to_t.max(stats.to_t);
            total.fr_tm = total.fr_tm.min(stats.fr_tm);
            total.to_tm = total.to_tm.max(stats.to_tm);
            total.rows += stats.rows;
        }
        self.total = total;
    }
}

/// Finds the segment covering a rowid. Segments are sorted, so this is a
/// binary search.
#[must_use]
pub fn locate_segment(segments: &[SegmentInfo], rowid: Rowid) -> Option<usize> {
    let idx = segments.partition_point(|s| s.last_row < rowid);
    (idx < segments.len() && segments[idx].contains(rowid)).then_some(idx)
}

/// Reads a segment's stats from its index file: first and last entry plus
/// the record count. Returns `None` for an empty file.
fn load_segment_stats(path: &Path, id: &str) -> CoreResult<Option<SegmentStats>> {
    let backend = FileBackend::open_read_only(path)?;
    let size = backend.size()?;

    if size == 0 {
        return Ok(None);
    }
    if size % META_RECORD_SIZE != 0 {
        return Err(CoreError::corrupted(format!(
            "index file {} has length {size}, not a multiple of {META_RECORD_SIZE}",
            path.display()
        )));
    }

    let rows = size / META_RECORD_SIZE;
    let first = RecordMeta::decode(&backend.read_at(0, META_RECORD_SIZE as usize)?)?;
    let last = RecordMeta::decode(
        &backend.read_at(size - META_RECORD_SIZE, META_RECORD_SIZE as usize)?,
    )?;

    Ok(Some(SegmentStats {
        id: id.to_string(),
        fr_t: first.t().min(last.t()),
        to_t: first.t().max(last.t()),
        fr_tm: first.tm().min(last.tm()),
        to_tm: first.tm().max(last.tm()),
        rows,
    }))
}
