//! Record metadata: the fixed-size entries of segment index files.
//!
//! Every record appended to a topic gets one 32-byte metadata entry in its
//! segment's index file, stored big-endian:
//!
//! ```text
//! | t_word (8) | tm_word (8) | offset (8) | size (8) |
//! ```
//!
//! The two time words pack a flag field into their upper bits: bits 0..44
//! hold the timestamp, bits 44..60 hold a 16-bit flag. `t_word` carries the
//! wall-clock time plus the caller-defined user flag; `tm_word` carries the
//! fine-grained tie-break time plus the engine-internal system flag.
//!
//! Offsets and sizes locate the record's payload inside the segment content
//! file. The entry's position inside the index file is what gives a record
//! its place in the key stream, so rowids never need to be stored.

use crate::error::{CoreError, CoreResult};
use crate::types::Rowid;
use serde_json::json;

/// Size in bytes of one metadata entry.
pub const META_RECORD_SIZE: u64 = 32;

/// Bits 0..44 of a time word: the timestamp itself.
const TIME_MASK: u64 = 0x0000_0FFF_FFFF_FFFF;
/// Bits 44..60 of a time word: the packed 16-bit flag.
const FLAG_MASK: u64 = 0x0FFF_F000_0000_0000;
const FLAG_SHIFT: u32 = 44;

/// System flag bit: the record was delivered by a startup/disk scan rather
/// than a live append.
pub const SYS_FLAG_LOADED_FROM_DISK: u32 = 0x2000;

/// One record's metadata entry.
///
/// The in-memory form keeps the packed words exactly as stored; accessors
/// split out times and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    t_word: u64,
    tm_word: u64,
    /// Byte offset of the payload in the segment content file.
    pub offset: u64,
    /// Byte length of the payload, including the record terminator.
    pub size: u64,
}

impl RecordMeta {
    /// Creates a metadata entry for a new record.
    #[must_use]
    pub fn new(t: u64, tm: u64, user_flag: u32, offset: u64, size: u64) -> Self {
        let mut meta = Self {
            t_word: t & TIME_MASK,
            tm_word: tm & TIME_MASK,
            offset,
            size,
        };
        meta.set_user_flag(user_flag);
        meta
    }

    /// Wall-clock time of the record.
    #[must_use]
    pub fn t(&self) -> u64 {
        self.t_word & TIME_MASK
    }

    /// Fine-grained (tie-breaking) time of the record.
    #[must_use]
    pub fn tm(&self) -> u64 {
        self.tm_word & TIME_MASK
    }

    /// Caller-defined flag bits.
    #[must_use]
    pub fn user_flag(&self) -> u32 {
        ((self.t_word & FLAG_MASK) >> FLAG_SHIFT) as u32
    }

    /// Engine-internal flag bits.
    #[must_use]
    pub fn system_flag(&self) -> u32 {
        ((self.tm_word & FLAG_MASK) >> FLAG_SHIFT) as u32
    }

    /// Replaces the caller-defined flag bits.
    pub fn set_user_flag(&mut self, flag: u32) {
        self.t_word = (self.t_word & !FLAG_MASK) | (u64::from(flag & 0xFFFF) << FLAG_SHIFT);
    }

    /// Replaces the engine-internal flag bits.
    pub fn set_system_flag(&mut self, flag: u32) {
        self.tm_word = (self.tm_word & !FLAG_MASK) | (u64::from(flag & 0xFFFF) << FLAG_SHIFT);
    }

    /// Sets or clears a mask inside the caller-defined flag bits.
    pub fn apply_user_mask(&mut self, mask: u32, on: bool) {
        let flag = if on {
            self.user_flag() | mask
        } else {
            self.user_flag() & !mask
        };
        self.set_user_flag(flag);
    }

    /// Encodes the entry to its 32-byte big-endian on-disk form.
    #[must_use]
    pub fn encode(&self) -> [u8; META_RECORD_SIZE as usize] {
        let mut buf = [0u8; META_RECORD_SIZE as usize];
        buf[0..8].copy_from_slice(&self.t_word.to_be_bytes());
        buf[8..16].copy_from_slice(&self.tm_word.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..32].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    /// Decodes an entry from its on-disk form.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the slice is not exactly one entry long.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() != META_RECORD_SIZE as usize {
            return Err(CoreError::corrupted(format!(
                "metadata entry has {} bytes, expected {}",
                data.len(),
                META_RECORD_SIZE
            )));
        }

        let word = |range: std::ops::Range<usize>| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[range]);
            u64::from_be_bytes(bytes)
        };

        Ok(Self {
            t_word: word(0..8),
            tm_word: word(8..16),
            offset: word(16..24),
            size: word(24..32),
        })
    }

    /// Returns the metadata as a JSON object, the shape readers see attached
    /// to records under the metadata field.
    #[must_use]
    pub fn to_json(&self, rowid: Rowid) -> serde_json::Value {
        json!({
            "rowid": rowid,
            "t": self.t(),
            "tm": self.tm(),
            "user_flag": self.user_flag(),
            "offset": self.offset,
            "size": self.size,
        })
    }
}
