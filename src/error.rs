use std::fmt::Display;

/// Cinderstore errors.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreError {
    /// The requested id is not present in the index.
    IdNotFound(String),
    /// The requested id is present but has been deleted.
    IdDeleted(String),
    /// The requested id is present but its time to live has elapsed.
    TtlExpired(String),
    /// The index could not be created, typically because a segment file on
    /// disk failed to load.
    IndexCreationFailure(String),
    /// The log and the on-disk index disagree in a way recovery cannot
    /// reconcile, such as a duplicate non-delete message during replay.
    InitializationError(String),
    /// Invalid data, typically decoding errors, corruption, or unexpected
    /// internal values.
    InvalidData(String),
    /// Invalid caller input, such as a file span behind the index end offset
    /// or a scan token pointing past a cleanly shut down log.
    InvalidArgument(String),
    /// A write was attempted on a read-only structure (mapped segment).
    ReadOnly,
    /// An IO error.
    Io(String),
}

impl std::error::Error for StoreError {}

impl Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StoreError::IdNotFound(msg) => write!(f, "id not found: {msg}"),
            StoreError::IdDeleted(msg) => write!(f, "id deleted: {msg}"),
            StoreError::TtlExpired(msg) => write!(f, "ttl expired: {msg}"),
            StoreError::IndexCreationFailure(msg) => write!(f, "index creation failure: {msg}"),
            StoreError::InitializationError(msg) => write!(f, "initialization error: {msg}"),
            StoreError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            StoreError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            StoreError::ReadOnly => write!(f, "write attempted on read-only segment"),
            StoreError::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs a StoreError::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::StoreError::InvalidData(format!($($args)*)).into() };
}

/// Constructs a StoreError::InvalidArgument for the given format string.
#[macro_export]
macro_rules! errarg {
    ($($args:tt)*) => { $crate::error::StoreError::InvalidArgument(format!($($args)*)).into() };
}

/// A cinderstore Result returning StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<StoreError> for Result<T> {
    fn from(error: StoreError) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Io(err.to_string())
    }
}
