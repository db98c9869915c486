use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errarg;
use crate::error::Result;
use crate::store::key::StoreKey;

/// Encoded size of an [`IndexValue`]: offset (8) + size (8) + flags (1) +
/// time to live (8).
pub const INDEX_VALUE_SIZE_IN_BYTES: u32 = 25;

/// Time-to-live sentinel for entries that never expire.
pub const TTL_INFINITE: i64 = -1;

/// Flag bits carried by an [`IndexValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flags {
    DeleteIndex = 0x01,
}

/// The fixed-width record an index segment stores per key: where the message
/// lives in the log, how large it is, its flags, and when it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexValue {
    offset: u64,
    size: u64,
    flags: u8,
    time_to_live_ms: i64,
}

impl IndexValue {
    pub fn new(size: u64, offset: u64, time_to_live_ms: i64) -> Self {
        Self {
            offset,
            size,
            flags: 0,
            time_to_live_ms,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn time_to_live_ms(&self) -> i64 {
        self.time_to_live_ms
    }

    pub fn set_flag(&mut self, flag: Flags) {
        self.flags |= flag as u8;
    }

    pub fn is_flag_set(&self, flag: Flags) -> bool {
        self.flags & (flag as u8) != 0
    }

    /// Points the value at a new log position. Used when a delete marker
    /// supersedes the original message record.
    pub fn set_new_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn set_new_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn is_expired(&self) -> bool {
        self.time_to_live_ms != TTL_INFINITE && self.time_to_live_ms <= current_time_ms()
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<BigEndian>(self.offset)?;
        writer.write_u64::<BigEndian>(self.size)?;
        writer.write_u8(self.flags)?;
        writer.write_i64::<BigEndian>(self.time_to_live_ms)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let offset = reader.read_u64::<BigEndian>()?;
        let size = reader.read_u64::<BigEndian>()?;
        let flags = reader.read_u8()?;
        let time_to_live_ms = reader.read_i64::<BigEndian>()?;
        Ok(Self {
            offset,
            size,
            flags,
            time_to_live_ms,
        })
    }
}

/// Milliseconds since the unix epoch.
pub fn current_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A (key, value) pair headed for the index.
#[derive(Debug, Clone)]
pub struct IndexEntry<K: StoreKey> {
    key: K,
    value: IndexValue,
}

impl<K: StoreKey> IndexEntry<K> {
    pub fn new(key: K, value: IndexValue) -> Self {
        Self { key, value }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &IndexValue {
        &self.value
    }
}

/// The half-open `[start, end)` byte range a message occupies in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    start_offset: u64,
    end_offset: u64,
}

impl FileSpan {
    pub fn new(start_offset: u64, end_offset: u64) -> Result<Self> {
        if start_offset > end_offset {
            return errarg!("file span start {start_offset} is past end {end_offset}");
        }
        Ok(Self {
            start_offset,
            end_offset,
        })
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }
}
