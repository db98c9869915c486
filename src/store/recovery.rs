use crate::error::Result;
use crate::store::key::StoreKeyFactory;
use crate::store::log::Log;
use crate::store::message::MessageInfo;

/// Replays a range of the log into message summaries so the index can
/// reconcile itself with whatever actually made it to disk. Implementations
/// understand the message format stored in the log; the index does not.
pub trait MessageStoreRecovery<F: StoreKeyFactory>: Send + Sync {
    /// Scan the log from `start_offset` (inclusive) to `end_offset`
    /// (exclusive) and return the messages found there, in log order.
    fn recover(
        &self,
        log: &dyn Log,
        start_offset: u64,
        end_offset: u64,
        factory: &F,
    ) -> Result<Vec<MessageInfo<F::Key>>>;
}
