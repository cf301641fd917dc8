//! The block-framed record log used by both write-ahead logs and manifests.
//!
//! A log file is a stream of 32 KiB blocks. Each physical record carries a
//! 7-byte header (masked CRC32C of type+payload, payload length, type); a
//! logical record that does not fit in the block's remainder is split with
//! First/Middle/Last types, and block trailers too small for a header are
//! zero-filled.

mod reader;
mod writer;

pub(crate) use self::reader::{LogReader, LogReporter};
pub(crate) use self::writer::LogWriter;


/// Physical block size of the log format.
pub(crate) const LOG_BLOCK_SIZE: usize = 1 << 15;

/// Checksum (4) + length (2) + type (1).
pub(crate) const LOG_HEADER_SIZE: usize = 7;

/// Physical record types. `Zero` is reserved for zero-filled trailers and
/// preallocated file regions; readers skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordType {
    Zero   = 0,
    Full   = 1,
    First  = 2,
    Middle = 3,
    Last   = 4,
}

impl RecordType {
    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Zero),
            1 => Some(Self::Full),
            2 => Some(Self::First),
            3 => Some(Self::Middle),
            4 => Some(Self::Last),
            _ => None,
        }
    }
}
