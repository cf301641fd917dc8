use std::io::Result as IoResult;

use strata_sstable::mask_checksum;
use strata_vfs::WritableFile;

use super::{RecordType, LOG_BLOCK_SIZE, LOG_HEADER_SIZE};


/// Appends logical records to a log file, framing them into blocks.
///
/// A failed append leaves the file with a partial physical record; the
/// writer must not be used further (recovery will truncate at the damage).
pub(crate) struct LogWriter<F> {
    file:            F,
    /// Bytes left in the current block, in `0..=LOG_BLOCK_SIZE`.
    remaining_space: usize,
    /// CRC32C of each record type's byte, the fixed prefix of every record
    /// checksum.
    type_checksums:  [u32; 5],
}

fn type_checksums() -> [u32; 5] {
    [0, 1, 2, 3, 4].map(|type_byte| crc32c::crc32c(&[type_byte]))
}

impl<F: WritableFile> LogWriter<F> {
    /// A writer for a fresh (empty) log file.
    pub(crate) fn new(file: F) -> Self {
        Self {
            file,
            remaining_space: LOG_BLOCK_SIZE,
            type_checksums:  type_checksums(),
        }
    }

    /// A writer resuming at byte `offset` of an existing log file (the
    /// reuse-logs path).
    pub(crate) fn new_at_offset(file: F, offset: u64) -> Self {
        let offset_in_block = (offset % LOG_BLOCK_SIZE as u64) as usize;
        Self {
            file,
            remaining_space: LOG_BLOCK_SIZE - offset_in_block,
            type_checksums:  type_checksums(),
        }
    }

    /// Frame and append one logical record. The write is buffered; call
    /// [`sync`](Self::sync) for durability.
    pub(crate) fn add_record(&mut self, mut record: &[u8]) -> IoResult<()> {
        let mut first_fragment = true;
        const MAX_TRAILER: [u8; LOG_HEADER_SIZE - 1] = [0; LOG_HEADER_SIZE - 1];

        // An empty record is written as an empty Full fragment.
        while !record.is_empty() || first_fragment {
            if let Some(trailer) = MAX_TRAILER.get(..self.remaining_space) {
                // Too little room for even a header: zero-fill and move to
                // the next block. A header never straddles blocks.
                self.file.write_all(trailer)?;
                self.remaining_space = LOG_BLOCK_SIZE;
            }

            let fragment_len = record.len().min(self.remaining_space - LOG_HEADER_SIZE);
            let last_fragment = fragment_len == record.len();

            let record_type = match (first_fragment, last_fragment) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, false) => RecordType::Middle,
                (false, true) => RecordType::Last,
            };

            let (fragment, rest) = record.split_at(fragment_len);
            self.write_fragment(record_type, fragment)?;

            record = rest;
            first_fragment = false;
            self.remaining_space -= LOG_HEADER_SIZE + fragment_len;
        }

        self.file.flush()
    }

    pub(crate) fn sync(&mut self) -> IoResult<()> {
        self.file.sync_data()
    }

    fn write_fragment(&mut self, record_type: RecordType, fragment: &[u8]) -> IoResult<()> {
        let checksum =
            crc32c::crc32c_append(self.type_checksums[record_type as usize], fragment);

        self.file.write_all(&mask_checksum(checksum).to_le_bytes())?;
        self.file.write_all(&(fragment.len() as u16).to_le_bytes())?;
        self.file.write_all(&[record_type as u8])?;
        self.file.write_all(fragment)
    }
}
