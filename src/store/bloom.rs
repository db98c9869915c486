//! Bloom filter sidecars for mapped index segments.
//!
//! A mapped segment answers `find` with a binary search over its file. The
//! bloom filter in front of it turns most misses into a single in-memory
//! check. Sidecars are rebuildable: a missing or corrupt `.bloom` file is
//! regenerated from the segment keys, never trusted.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bloomfilter::Bloom;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errdata;
use crate::error::Result;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const BLOOM_VERSION: u16 = 0;

/// Bloom filter over serialized key bytes, persistable to a sidecar file.
pub struct BloomFilter {
    inner: Bloom<Vec<u8>>,
}

impl BloomFilter {
    /// Create an empty filter sized for `items` keys at the given false
    /// positive rate.
    pub fn with_capacity(items: usize, fp_rate: f64) -> Self {
        Self {
            inner: Bloom::new_for_fp_rate(items.max(1), fp_rate),
        }
    }

    pub fn add(&mut self, key_bytes: Vec<u8>) {
        self.inner.set(&key_bytes);
    }

    /// True if the key may be present, false if it definitely is not.
    pub fn check(&self, key_bytes: &Vec<u8>) -> bool {
        self.inner.check(key_bytes)
    }

    /// Persist the filter to `path`.
    ///
    /// Layout: `version:u16 | numBits:u64 | numHashes:u32 | sipKeys:4xu64 |
    /// bitmapLen:u32 | bitmap | crc32:u32`, big-endian.
    pub fn store(&self, path: &Path) -> Result<()> {
        let bitmap = self.inner.bitmap();
        let sip_keys = self.inner.sip_keys();

        let mut buf = Vec::with_capacity(50 + bitmap.len());
        buf.write_u16::<BigEndian>(BLOOM_VERSION)?;
        buf.write_u64::<BigEndian>(self.inner.number_of_bits())?;
        buf.write_u32::<BigEndian>(self.inner.number_of_hash_functions())?;
        for (k0, k1) in sip_keys {
            buf.write_u64::<BigEndian>(k0)?;
            buf.write_u64::<BigEndian>(k1)?;
        }
        buf.write_u32::<BigEndian>(bitmap.len() as u32)?;
        buf.write_all(&bitmap)?;
        let crc = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(crc)?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(&file);
        writer.write_all(&buf)?;
        writer.flush()?;
        file.sync_all()?;
        Ok(())
    }

    /// Load a filter previously written by `store`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
        if bytes.len() < 4 {
            return errdata!("bloom file {} is truncated", path.display());
        }

        let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored_crc = u32::from_be_bytes(crc_bytes.try_into().unwrap());
        if CRC32.checksum(payload) != stored_crc {
            return errdata!("bloom file {} failed checksum", path.display());
        }

        let mut reader = payload;
        let version = reader.read_u16::<BigEndian>()?;
        if version != BLOOM_VERSION {
            return errdata!("bloom file {} has unknown version {version}", path.display());
        }
        let number_of_bits = reader.read_u64::<BigEndian>()?;
        let number_of_hashes = reader.read_u32::<BigEndian>()?;
        let mut sip_keys = [(0u64, 0u64); 2];
        for key in sip_keys.iter_mut() {
            key.0 = reader.read_u64::<BigEndian>()?;
            key.1 = reader.read_u64::<BigEndian>()?;
        }
        let bitmap_len = reader.read_u32::<BigEndian>()? as usize;
        if reader.len() != bitmap_len {
            return errdata!(
                "bloom file {} bitmap length {} does not match remaining {} bytes",
                path.display(),
                bitmap_len,
                reader.len()
            );
        }

        Ok(Self {
            inner: Bloom::from_existing(reader, number_of_bits, number_of_hashes, sip_keys),
        })
    }
}
