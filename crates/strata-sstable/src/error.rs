use std::io::{Error as IoError, ErrorKind};

use thiserror::Error;


pub type TableResult<T> = Result<T, TableError>;

/// Errors from building or reading a table.
///
/// Cloneable so that an iterator can latch an error and keep reporting it
/// from `status()`; the IO variant keeps the kind and rendered message
/// rather than the uncloneable [`std::io::Error`].
#[derive(Error, Debug, Clone)]
pub enum TableError {
    /// The bytes on storage are not a valid table (bad magic, bad checksum,
    /// undecodable block, unknown compression, ...).
    #[error("table corruption: {0}")]
    Corruption(String),
    /// The underlying file failed to read or write.
    #[error("table io error: {message}")]
    Io { kind: ErrorKind, message: String },
}

impl TableError {
    #[must_use]
    pub fn corruption(detail: impl Into<String>) -> Self {
        Self::Corruption(detail.into())
    }
}

impl From<IoError> for TableError {
    fn from(err: IoError) -> Self {
        Self::Io { kind: err.kind(), message: err.to_string() }
    }
}
