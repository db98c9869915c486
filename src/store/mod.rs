//! The store core: a persistent log-structured index over an append-only
//! log, plus the scan protocol replication rides on.

pub mod bloom;
pub mod index;
pub mod journal;
pub mod key;
pub mod log;
pub mod message;
pub mod recovery;
pub mod segment;
pub mod token;
pub mod value;

pub use index::{IndexPersistorTask, PersistentIndex, CLEAN_SHUTDOWN_FILENAME};
pub use journal::{Journal, JournalEntry};
pub use key::{StoreKey, StoreKeyFactory};
pub use log::Log;
pub use message::{BlobReadOptions, FindInfo, MessageInfo};
pub use recovery::MessageStoreRecovery;
pub use segment::IndexSegment;
pub use token::{StoreFindToken, TokenPosition};
pub use value::{FileSpan, Flags, IndexEntry, IndexValue, INDEX_VALUE_SIZE_IN_BYTES, TTL_INFINITE};
