use crate::store::key::StoreKey;
use crate::store::token::StoreFindToken;

/// Summary of one message in the log, as surfaced by recovery and by
/// replication scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo<K: StoreKey> {
    key: K,
    size: u64,
    deleted: bool,
    expiration_time_ms: i64,
}

impl<K: StoreKey> MessageInfo<K> {
    pub fn new(key: K, size: u64, deleted: bool, expiration_time_ms: i64) -> Self {
        Self {
            key,
            size,
            deleted,
            expiration_time_ms,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn expiration_time_ms(&self) -> i64 {
        self.expiration_time_ms
    }
}

/// Where to read a live blob from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReadOptions<K: StoreKey> {
    offset: u64,
    size: u64,
    time_to_live_ms: i64,
    key: K,
}

impl<K: StoreKey> BlobReadOptions<K> {
    pub fn new(offset: u64, size: u64, time_to_live_ms: i64, key: K) -> Self {
        Self {
            offset,
            size,
            time_to_live_ms,
            key,
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

    pub fn key(&self) -> &K {
        &self.key
    }
}

/// Result of one `find_entries_since` call: the entries found and the token
/// to resume the next call with.
#[derive(Debug, Clone)]
pub struct FindInfo<K: StoreKey> {
    entries: Vec<MessageInfo<K>>,
    token: StoreFindToken<K>,
}

impl<K: StoreKey> FindInfo<K> {
    pub fn new(entries: Vec<MessageInfo<K>>, token: StoreFindToken<K>) -> Self {
        Self { entries, token }
    }

    pub fn entries(&self) -> &[MessageInfo<K>] {
        &self.entries
    }

    pub fn token(&self) -> &StoreFindToken<K> {
        &self.token
    }

    pub fn into_parts(self) -> (Vec<MessageInfo<K>>, StoreFindToken<K>) {
        (self.entries, self.token)
    }
}
