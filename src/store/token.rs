use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt};
use uuid::Uuid;

use crate::errdata;
use crate::error::Result;
use crate::store::key::{StoreKey, StoreKeyFactory};

const TOKEN_VERSION: u16 = 0;

/// Wire sentinel for an absent offset field.
pub const UNINITIALIZED_OFFSET: i64 = -1;

/// Where a scan cursor points.
///
/// A cursor normally tracks a log offset served by the journal. Once it
/// falls outside the journal's retained window, the cursor pins the segment
/// being walked and the last key returned from it. This works because the
/// journal is always at least as long as the writable segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPosition<K: StoreKey> {
    /// Scan from the beginning of the store.
    Uninitialized,
    /// Resume from a log offset tracked by the journal.
    Journal { offset: u64 },
    /// Resume within a segment, after `key`.
    Segment { index_start_offset: u64, key: K },
}

/// Resumable cursor handed to replication consumers by
/// `find_entries_since`. Carries the issuing index's session id and a
/// producer-set `bytes_read` lag indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFindToken<K: StoreKey> {
    position: TokenPosition<K>,
    session_id: Option<Uuid>,
    bytes_read: Option<u64>,
}

impl<K: StoreKey> StoreFindToken<K> {
    /// A token that starts a scan from the beginning of the store.
    pub fn new() -> Self {
        Self {
            position: TokenPosition::Uninitialized,
            session_id: None,
            bytes_read: None,
        }
    }

    pub fn journal_based(offset: u64, session_id: Uuid) -> Self {
        Self {
            position: TokenPosition::Journal { offset },
            session_id: Some(session_id),
            bytes_read: None,
        }
    }

    pub fn segment_based(key: K, index_start_offset: u64, session_id: Uuid) -> Self {
        Self {
            position: TokenPosition::Segment {
                index_start_offset,
                key,
            },
            session_id: Some(session_id),
            bytes_read: None,
        }
    }

    pub fn position(&self) -> &TokenPosition<K> {
        &self.position
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// Journal offset in wire form, `-1` when this is not a journal token.
    pub fn offset(&self) -> i64 {
        match &self.position {
            TokenPosition::Journal { offset } => *offset as i64,
            _ => UNINITIALIZED_OFFSET,
        }
    }

    /// Segment start offset in wire form, `-1` when this is not a segment
    /// token.
    pub fn index_start_offset(&self) -> i64 {
        match &self.position {
            TokenPosition::Segment {
                index_start_offset, ..
            } => *index_start_offset as i64,
            _ => UNINITIALIZED_OFFSET,
        }
    }

    pub fn store_key(&self) -> Option<&K> {
        match &self.position {
            TokenPosition::Segment { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Bytes of log this consumer has covered. Set by the producer before
    /// the token is returned; `None` on tokens the consumer built itself.
    pub fn bytes_read(&self) -> Option<u64> {
        self.bytes_read
    }

    pub fn set_bytes_read(&mut self, bytes_read: u64) {
        self.bytes_read = Some(bytes_read);
    }

    /// Serialized form. `bytes_read` is a producer-side annotation and does
    /// not travel.
    pub fn to_bytes(&self) -> Vec<u8> {
        let session = self
            .session_id
            .map(|id| id.to_string().into_bytes())
            .unwrap_or_default();

        let mut buf = Vec::with_capacity(2 + 4 + session.len() + 8 + 8);
        buf.extend_from_slice(&TOKEN_VERSION.to_be_bytes());
        buf.extend_from_slice(&(session.len() as u32).to_be_bytes());
        buf.extend_from_slice(&session);
        buf.extend_from_slice(&self.offset().to_be_bytes());
        buf.extend_from_slice(&self.index_start_offset().to_be_bytes());
        if let TokenPosition::Segment { key, .. } = &self.position {
            buf.extend_from_slice(&key.to_bytes());
        }
        buf
    }

    /// Decode a token previously produced by `to_bytes`.
    pub fn from_bytes<F: StoreKeyFactory<Key = K>>(
        stream: &mut dyn Read,
        factory: &F,
    ) -> Result<Self> {
        let version = stream.read_u16::<BigEndian>()?;
        if version != TOKEN_VERSION {
            return errdata!("unknown find token version {version}");
        }

        let session_len = stream.read_u32::<BigEndian>()? as usize;
        let session_id = if session_len > 0 {
            let mut bytes = vec![0u8; session_len];
            stream.read_exact(&mut bytes)?;
            let text = String::from_utf8(bytes)
                .map_err(|e| crate::error::StoreError::InvalidData(e.to_string()))?;
            Some(
                Uuid::parse_str(&text)
                    .map_err(|e| crate::error::StoreError::InvalidData(e.to_string()))?,
            )
        } else {
            None
        };

        let offset = stream.read_i64::<BigEndian>()?;
        let index_start_offset = stream.read_i64::<BigEndian>()?;

        let position = if index_start_offset != UNINITIALIZED_OFFSET {
            TokenPosition::Segment {
                index_start_offset: index_start_offset as u64,
                key: factory.get_store_key(stream)?,
            }
        } else if offset != UNINITIALIZED_OFFSET {
            TokenPosition::Journal {
                offset: offset as u64,
            }
        } else {
            TokenPosition::Uninitialized
        };

        Ok(Self {
            position,
            session_id,
            bytes_read: None,
        })
    }
}

impl<K: StoreKey> Default for StoreFindToken<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StoreKey> std::fmt::Display for StoreFindToken<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "version: {TOKEN_VERSION}")?;
        if let Some(session) = self.session_id {
            write!(f, " sessionId {session}")?;
        }
        match &self.position {
            TokenPosition::Uninitialized => write!(f, " uninitialized")?,
            TokenPosition::Journal { offset } => write!(f, " offset {offset}")?,
            TokenPosition::Segment {
                index_start_offset,
                key,
            } => write!(f, " indexStartOffset {index_start_offset} storeKey {key}")?,
        }
        if let Some(bytes_read) = self.bytes_read {
            write!(f, " bytesRead {bytes_read}")?;
        }
        Ok(())
    }
}
