//! Index segment files and their in-memory twin.
//!
//! A segment is a sorted key -> value map covering a contiguous range of the
//! log. It starts life *mutable* (a BTreeMap owned by the writer) and is
//! later flushed and *mapped* (a read-only memory map of the flushed file,
//! fronted by an optional bloom filter). The transition is one-way.
//!
//! ## Segment File Layout
//!
//! ```text
//! +--------------------------+
//! | version          (u16)   |
//! | keySize          (u32)   |
//! | valueSize        (u32)   |
//! | startOffset      (u64)   |
//! | endOffset        (u64)   |
//! | numEntries       (u32)   |
//! +--------------------------+
//! | key || value             |  records sorted by key,
//! | key || value             |  each keySize + valueSize bytes
//! | ...                      |
//! +--------------------------+
//! | crc32            (u32)   |
//! +--------------------------+
//! ```
//!
//! Files are named `<startOffset>_segment.index`, with an optional
//! `<startOffset>_segment.bloom` sidecar, so a directory listing sorts into
//! log order by the numeric prefix.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use memmap2::Mmap;

use crate::errarg;
use crate::errdata;
use crate::error::{Result, StoreError};
use crate::store::bloom::BloomFilter;
use crate::store::key::{StoreKey, StoreKeyFactory};
use crate::store::message::MessageInfo;
use crate::store::value::{Flags, IndexEntry, IndexValue};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const SEGMENT_VERSION: u16 = 0;
pub const INDEX_FILE_SUFFIX: &str = "index";
pub const BLOOM_FILE_SUFFIX: &str = "bloom";
const SEGMENT_NAME: &str = "segment";

/// version + keySize + valueSize + startOffset + endOffset + numEntries
const HEADER_SIZE: u64 = 2 + 4 + 4 + 8 + 8 + 4;
const CRC_SIZE: u64 = 4;

/// File name of the segment starting at `start_offset`.
pub fn index_file_name(start_offset: u64) -> String {
    format!("{start_offset}_{SEGMENT_NAME}.{INDEX_FILE_SUFFIX}")
}

fn bloom_file_name(start_offset: u64) -> String {
    format!("{start_offset}_{SEGMENT_NAME}.{BLOOM_FILE_SUFFIX}")
}

/// Extract the start offset from a `<startOffset>_<name>.index` file name.
pub fn parse_start_offset(path: &Path) -> Result<u64> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::InvalidData(format!("bad segment path {}", path.display())))?;
    name.split('_')
        .next()
        .and_then(|prefix| prefix.parse::<u64>().ok())
        .ok_or_else(|| StoreError::InvalidData(format!("bad segment file name {name}")))
}

enum State<F: StoreKeyFactory> {
    Mutable {
        entries: BTreeMap<F::Key, IndexValue>,
        end_offset: Option<u64>,
    },
    Mapped {
        mmap: Mmap,
        end_offset: u64,
        num_entries: u32,
        bloom: Option<BloomFilter>,
    },
}

/// One sorted run of the index, covering log offsets
/// `[start_offset, end_offset)`.
pub struct IndexSegment<F: StoreKeyFactory> {
    start_offset: u64,
    index_path: PathBuf,
    bloom_path: PathBuf,
    key_size: u32,
    value_size: u32,
    bloom_fp_rate: f64,
    factory: Arc<F>,
    state: RwLock<State<F>>,
}

impl<F: StoreKeyFactory> IndexSegment<F> {
    /// Create an empty mutable segment starting at `start_offset`.
    pub fn new(
        data_dir: &Path,
        start_offset: u64,
        key_size: u32,
        value_size: u32,
        bloom_fp_rate: f64,
        factory: Arc<F>,
    ) -> Self {
        Self {
            start_offset,
            index_path: data_dir.join(index_file_name(start_offset)),
            bloom_path: data_dir.join(bloom_file_name(start_offset)),
            key_size,
            value_size,
            bloom_fp_rate,
            factory,
            state: RwLock::new(State::Mutable {
                entries: BTreeMap::new(),
                end_offset: None,
            }),
        }
    }

    /// Load a segment from an existing `.index` file. When `map` is set the
    /// file is memory-mapped read-only; otherwise its records are read back
    /// into a mutable map so recovery can extend it.
    pub fn from_file(path: &Path, map: bool, bloom_fp_rate: f64, factory: Arc<F>) -> Result<Self> {
        let start_offset = parse_start_offset(path)?;
        let data_dir = path
            .parent()
            .ok_or_else(|| StoreError::InvalidData(format!("bad segment path {}", path.display())))?;

        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let header = verify_segment_bytes(&mmap, path)?;
        if header.start_offset != start_offset {
            return errdata!(
                "segment {} header start offset {} does not match file name",
                path.display(),
                header.start_offset
            );
        }

        let segment = Self {
            start_offset,
            index_path: path.to_path_buf(),
            bloom_path: data_dir.join(bloom_file_name(start_offset)),
            key_size: header.key_size,
            value_size: header.value_size,
            bloom_fp_rate,
            factory,
            state: RwLock::new(State::Mutable {
                entries: BTreeMap::new(),
                end_offset: None,
            }),
        };

        if map {
            let bloom = segment.load_or_build_bloom(&mmap, &header);
            *segment.state.write().unwrap() = State::Mapped {
                mmap,
                end_offset: header.end_offset,
                num_entries: header.num_entries,
                bloom,
            };
        } else {
            let mut entries = BTreeMap::new();
            let record_size = (header.key_size + header.value_size) as usize;
            for i in 0..header.num_entries as usize {
                let record = &mmap[HEADER_SIZE as usize + i * record_size..];
                let mut reader = &record[..record_size];
                let key = segment.factory.get_store_key(&mut reader)?;
                let value = IndexValue::read_from(&mut reader)?;
                entries.insert(key, value);
            }
            *segment.state.write().unwrap() = State::Mutable {
                entries,
                end_offset: Some(header.end_offset),
            };
        }
        Ok(segment)
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Log offset just past the last covered byte. `None` while the segment
    /// has never received an entry.
    pub fn end_offset(&self) -> Option<u64> {
        match &*self.state.read().unwrap() {
            State::Mutable { end_offset, .. } => *end_offset,
            State::Mapped { end_offset, .. } => Some(*end_offset),
        }
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    pub fn is_mapped(&self) -> bool {
        matches!(&*self.state.read().unwrap(), State::Mapped { .. })
    }

    pub fn number_of_items(&self) -> usize {
        match &*self.state.read().unwrap() {
            State::Mutable { entries, .. } => entries.len(),
            State::Mapped { num_entries, .. } => *num_entries as usize,
        }
    }

    /// Size this segment occupies (or would occupy) on disk.
    pub fn size_written(&self) -> u64 {
        match &*self.state.read().unwrap() {
            State::Mutable { entries, .. } => {
                HEADER_SIZE
                    + entries.len() as u64 * (self.key_size + self.value_size) as u64
                    + CRC_SIZE
            }
            State::Mapped { mmap, .. } => mmap.len() as u64,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.index_path
    }

    /// Add one entry. The segment must be mutable, the key must match the
    /// segment's key size, and `new_end_offset` must not move backwards.
    pub fn add_entry(&self, entry: IndexEntry<F::Key>, new_end_offset: u64) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let State::Mutable { entries, end_offset } = &mut *state else {
            return Err(StoreError::ReadOnly);
        };
        if entry.key().size_in_bytes() != self.key_size as usize {
            return errarg!(
                "key size {} does not match segment key size {}",
                entry.key().size_in_bytes(),
                self.key_size
            );
        }
        if let Some(current) = *end_offset {
            if new_end_offset < current {
                return errarg!(
                    "new end offset {new_end_offset} is behind current end offset {current}"
                );
            }
        }
        // Last write wins; a delete marker replaces the original record.
        entries.insert(entry.key().clone(), *entry.value());
        *end_offset = Some(new_end_offset);
        Ok(())
    }

    /// Add a batch of entries sharing one end offset.
    pub fn add_entries(
        &self,
        batch: Vec<IndexEntry<F::Key>>,
        new_end_offset: u64,
    ) -> Result<()> {
        for entry in batch {
            self.add_entry(entry, new_end_offset)?;
        }
        Ok(())
    }

    /// Look up a key in this segment.
    pub fn find(&self, key: &F::Key) -> Result<Option<IndexValue>> {
        match &*self.state.read().unwrap() {
            State::Mutable { entries, .. } => Ok(entries.get(key).copied()),
            State::Mapped {
                mmap,
                num_entries,
                bloom,
                ..
            } => {
                if let Some(bloom) = bloom {
                    if !bloom.check(&key.to_bytes()) {
                        return Ok(None);
                    }
                }
                self.mapped_find(mmap, *num_entries, key)
            }
        }
    }

    /// Append into `out` the entries strictly after `after_key` (all entries
    /// when `after_key` is `None`), in key order, accumulating message sizes
    /// into `acc` and stopping once `acc` reaches `max_total_size`.
    pub fn get_entries_since(
        &self,
        after_key: Option<&F::Key>,
        max_total_size: u64,
        out: &mut Vec<MessageInfo<F::Key>>,
        acc: &mut u64,
    ) -> Result<()> {
        match &*self.state.read().unwrap() {
            State::Mutable { entries, .. } => {
                let range = match after_key {
                    Some(key) => entries.range((Bound::Excluded(key.clone()), Bound::Unbounded)),
                    None => entries.range::<F::Key, _>(..),
                };
                for (key, value) in range {
                    out.push(message_info(key.clone(), value));
                    *acc += value.size();
                    if *acc >= max_total_size {
                        break;
                    }
                }
                Ok(())
            }
            State::Mapped {
                mmap, num_entries, ..
            } => {
                let start = match after_key {
                    Some(key) => self.mapped_upper_bound(mmap, *num_entries, key)?,
                    None => 0,
                };
                let record_size = (self.key_size + self.value_size) as usize;
                for i in start..*num_entries as usize {
                    let record = &mmap[HEADER_SIZE as usize + i * record_size..];
                    let mut reader = &record[..record_size];
                    let key = self.factory.get_store_key(&mut reader)?;
                    let value = IndexValue::read_from(&mut reader)?;
                    out.push(message_info(key, &value));
                    *acc += value.size();
                    if *acc >= max_total_size {
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    /// Serialize the segment to its `.index` file, covering the log up to
    /// `end_offset_at_flush`. The write goes to a temp file, is synced, and
    /// renamed into place.
    pub fn write_index_to_file(&self, end_offset_at_flush: u64) -> Result<()> {
        let state = self.state.read().unwrap();
        let State::Mutable { entries, .. } = &*state else {
            return Err(StoreError::ReadOnly);
        };

        // Only records the log already holds at the flush point are written.
        let persisted: Vec<_> = entries
            .iter()
            .filter(|(_, value)| value.offset() < end_offset_at_flush)
            .collect();

        let mut buf = Vec::with_capacity(
            (HEADER_SIZE + CRC_SIZE) as usize
                + persisted.len() * (self.key_size + self.value_size) as usize,
        );
        buf.write_u16::<BigEndian>(SEGMENT_VERSION)?;
        buf.write_u32::<BigEndian>(self.key_size)?;
        buf.write_u32::<BigEndian>(self.value_size)?;
        buf.write_u64::<BigEndian>(self.start_offset)?;
        buf.write_u64::<BigEndian>(end_offset_at_flush)?;
        buf.write_u32::<BigEndian>(persisted.len() as u32)?;
        for (key, value) in &persisted {
            buf.write_all(&key.to_bytes())?;
            value.write_to(&mut buf)?;
        }
        let crc = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(crc)?;

        let tmp_path = self.index_path.with_extension("tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(&file);
        writer.write_all(&buf)?;
        writer.flush()?;
        file.sync_all()?;
        drop(writer);
        fs::rename(&tmp_path, &self.index_path)?;
        Ok(())
    }

    /// Memory-map the flushed file and drop the in-memory map. The segment
    /// becomes read-only; there is no way back for this instance.
    pub fn map(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if matches!(&*state, State::Mapped { .. }) {
            return Ok(());
        }

        let file = File::open(&self.index_path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let header = verify_segment_bytes(&mmap, &self.index_path)?;
        let bloom = self.load_or_build_bloom(&mmap, &header);

        *state = State::Mapped {
            mmap,
            end_offset: header.end_offset,
            num_entries: header.num_entries,
            bloom,
        };
        Ok(())
    }

    /// Load the bloom sidecar, or rebuild and persist it from the mapped
    /// file's keys. A bloom is an optimization; failures only cost speed.
    fn load_or_build_bloom(&self, mmap: &Mmap, header: &SegmentHeader) -> Option<BloomFilter> {
        if self.bloom_path.exists() {
            match BloomFilter::load(&self.bloom_path) {
                Ok(bloom) => return Some(bloom),
                Err(e) => {
                    tracing::warn!(
                        file = %self.bloom_path.display(),
                        error = %e,
                        "Rebuilding unreadable bloom filter"
                    );
                }
            }
        }

        let mut bloom =
            BloomFilter::with_capacity(header.num_entries as usize, self.bloom_fp_rate);
        let record_size = (header.key_size + header.value_size) as usize;
        for i in 0..header.num_entries as usize {
            let record_start = HEADER_SIZE as usize + i * record_size;
            bloom.add(mmap[record_start..record_start + header.key_size as usize].to_vec());
        }
        if let Err(e) = bloom.store(&self.bloom_path) {
            tracing::warn!(
                file = %self.bloom_path.display(),
                error = %e,
                "Failed to persist bloom filter"
            );
        }
        Some(bloom)
    }

    fn mapped_find(&self, mmap: &Mmap, num_entries: u32, key: &F::Key) -> Result<Option<IndexValue>> {
        let record_size = (self.key_size + self.value_size) as usize;
        let mut lo = 0usize;
        let mut hi = num_entries as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let record = &mmap[HEADER_SIZE as usize + mid * record_size..];
            let mut reader = &record[..record_size];
            let mid_key = self.factory.get_store_key(&mut reader)?;
            match mid_key.cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    return Ok(Some(IndexValue::read_from(&mut reader)?));
                }
            }
        }
        Ok(None)
    }

    /// Index of the first record with key strictly greater than `key`.
    fn mapped_upper_bound(&self, mmap: &Mmap, num_entries: u32, key: &F::Key) -> Result<usize> {
        let record_size = (self.key_size + self.value_size) as usize;
        let mut lo = 0usize;
        let mut hi = num_entries as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let record = &mmap[HEADER_SIZE as usize + mid * record_size..];
            let mut reader = &record[..self.key_size as usize];
            let mid_key = self.factory.get_store_key(&mut reader)?;
            if mid_key <= *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

fn message_info<K: StoreKey>(key: K, value: &IndexValue) -> MessageInfo<K> {
    MessageInfo::new(
        key,
        value.size(),
        value.is_flag_set(Flags::DeleteIndex),
        value.time_to_live_ms(),
    )
}

struct SegmentHeader {
    key_size: u32,
    value_size: u32,
    start_offset: u64,
    end_offset: u64,
    num_entries: u32,
}

/// Validate a segment file image: length, version, checksum, record region.
fn verify_segment_bytes(bytes: &[u8], path: &Path) -> Result<SegmentHeader> {
    if (bytes.len() as u64) < HEADER_SIZE + CRC_SIZE {
        return errdata!("segment {} is truncated", path.display());
    }

    let (payload, crc_bytes) = bytes.split_at(bytes.len() - CRC_SIZE as usize);
    let stored_crc = u32::from_be_bytes(crc_bytes.try_into().unwrap());
    if CRC32.checksum(payload) != stored_crc {
        return errdata!("segment {} failed checksum", path.display());
    }

    let mut reader = payload;
    let version = reader.read_u16::<BigEndian>()?;
    if version != SEGMENT_VERSION {
        return errdata!("segment {} has unknown version {version}", path.display());
    }
    let key_size = reader.read_u32::<BigEndian>()?;
    let value_size = reader.read_u32::<BigEndian>()?;
    let start_offset = reader.read_u64::<BigEndian>()?;
    let end_offset = reader.read_u64::<BigEndian>()?;
    let num_entries = reader.read_u32::<BigEndian>()?;

    let expected = num_entries as u64 * (key_size + value_size) as u64;
    if reader.len() as u64 != expected {
        return errdata!(
            "segment {} record region is {} bytes, expected {expected}",
            path.display(),
            reader.len()
        );
    }
    Ok(SegmentHeader {
        key_size,
        value_size,
        start_offset,
        end_offset,
        num_entries,
    })
}
