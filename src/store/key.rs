use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::io::Read;

use crate::error::Result;

/// An opaque blob identifier. Keys are totally ordered, hashable, and encode
/// to a fixed number of bytes; every key within one index segment has the
/// same encoded size.
pub trait StoreKey:
    Clone + Ord + Eq + Hash + Debug + Display + Send + Sync + 'static
{
    /// The number of bytes `to_bytes` produces for this key.
    fn size_in_bytes(&self) -> usize;

    /// Serialized form of the key. Must be self-describing so that a
    /// [`StoreKeyFactory`] can decode it from a stream without out-of-band
    /// length information.
    fn to_bytes(&self) -> Vec<u8>;
}

/// Deserializes store keys from a byte stream.
pub trait StoreKeyFactory: Send + Sync + 'static {
    type Key: StoreKey;

    /// Read one key from the stream.
    fn get_store_key(&self, stream: &mut dyn Read) -> Result<Self::Key>;
}
