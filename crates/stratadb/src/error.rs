use std::io::Error as IoError;

use thiserror::Error;

use strata_sstable::TableError;


pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong, in broad strokes. Mirrors the classic status codes of
/// log-structured stores; "ok" is [`Ok`] and "not found" is an `Ok(None)`
/// from [`get`], so neither needs a kind here.
///
/// [`get`]: crate::Database::get
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Stored bytes are not what they claim to be: bad checksum, bad magic,
    /// undecodable record or manifest.
    Corruption,
    /// The operation or configuration is not supported by this build.
    NotSupported,
    /// The caller passed something unusable (bad database name, clashing
    /// options, unknown comparator name).
    InvalidArgument,
    /// The filesystem failed underneath us.
    Io,
}

/// An error with a kind and a human-readable detail.
///
/// Cloneable so a latched background error can be handed to every
/// subsequent writer.
#[derive(Error, Debug, Clone)]
#[error("{}: {detail}", kind_name(*.kind))]
pub struct Error {
    pub kind:   ErrorKind,
    pub detail: String,
}

fn kind_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Corruption => "corruption",
        ErrorKind::NotSupported => "not supported",
        ErrorKind::InvalidArgument => "invalid argument",
        ErrorKind::Io => "io error",
    }
}

impl Error {
    #[must_use]
    pub fn corruption(detail: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Corruption, detail: detail.into() }
    }

    #[must_use]
    pub fn not_supported(detail: impl Into<String>) -> Self {
        Self { kind: ErrorKind::NotSupported, detail: detail.into() }
    }

    #[must_use]
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self { kind: ErrorKind::InvalidArgument, detail: detail.into() }
    }

    #[must_use]
    pub fn io(detail: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, detail: detail.into() }
    }
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Self::io(err.to_string())
    }
}

impl From<TableError> for Error {
    fn from(err: TableError) -> Self {
        match err {
            TableError::Corruption(detail) => Self::corruption(detail),
            TableError::Io { message, .. } => Self::io(message),
        }
    }
}
