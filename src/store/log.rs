use crate::error::Result;

/// The append-only log the index describes. The log is the source of truth
/// for message bytes; the index only ever bookkeeps offsets into it.
///
/// Writers append to the log first, obtain the resulting file span, and only
/// then tell the index about it. The persistor relies on `flush` completing
/// before any index segment referring to the flushed bytes is written.
pub trait Log: Send + Sync + 'static {
    /// Append `bytes` and return the offset of the first appended byte.
    fn append(&self, bytes: &[u8]) -> Result<u64>;

    /// Read `len` bytes starting at `offset`.
    fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// The current writable end of the log.
    fn log_end_offset(&self) -> u64;

    /// Move the writable end of the log, discarding anything beyond it.
    /// Called once after index recovery to drop an uncommitted tail.
    fn set_log_end_offset(&self, offset: u64) -> Result<()>;

    /// Total bytes present in the log files.
    fn size_in_bytes(&self) -> u64;

    /// Make all appended bytes durable.
    fn flush(&self) -> Result<()>;
}
