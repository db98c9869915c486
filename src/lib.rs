pub mod config;
pub mod error;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use scheduler::{PeriodicTask, Scheduler, TokioScheduler};
pub use store::{
    FileSpan, FindInfo, IndexEntry, IndexValue, Log, MessageInfo, MessageStoreRecovery,
    PersistentIndex, StoreFindToken, StoreKey, StoreKeyFactory,
};
