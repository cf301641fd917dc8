use std::io::Read;

use strata_sstable::unmask_checksum;
use strata_vfs::SequentialFile;

use super::{RecordType, LOG_BLOCK_SIZE, LOG_HEADER_SIZE};


/// Receives reports of skipped bytes when a log is damaged or truncated.
pub(crate) trait LogReporter {
    fn corruption(&mut self, bytes: usize, reason: &str);
}

/// Ignore all damage reports (used where a best-effort scan is wanted).
impl LogReporter for () {
    fn corruption(&mut self, _bytes: usize, _reason: &str) {}
}

enum Physical {
    Record(u8, Vec<u8>),
    BadRecord,
    Eof,
}

/// Reads logical records back out of a log file, verifying checksums and
/// resynchronizing past damage.
///
/// An EOF in the middle of a fragmented record is treated as a writer crash
/// and the fragments are silently dropped; all other damage is reported and
/// skipped.
pub(crate) struct LogReader<R> {
    file:            Box<dyn SequentialFile>,
    reporter:        R,
    /// Unparsed bytes of the current block.
    buffer:          Vec<u8>,
    buffer_offset:   usize,
    /// Whether the last block of the file has been read.
    reached_eof:     bool,
    /// Set until the first Full/First record when starting mid-file, so
    /// stray continuation fragments are dropped rather than reported.
    resyncing:       bool,
}

impl<R: LogReporter> LogReader<R> {
    pub(crate) fn new(file: Box<dyn SequentialFile>, reporter: R) -> Self {
        Self {
            file,
            reporter,
            buffer:        Vec::with_capacity(LOG_BLOCK_SIZE),
            buffer_offset: 0,
            reached_eof:   false,
            resyncing:     false,
        }
    }

    /// A reader that starts `initial_offset` bytes into the file, dropping
    /// any record fragments that begin before the first complete record.
    pub(crate) fn new_at_offset(
        mut file:       Box<dyn SequentialFile>,
        reporter:       R,
        initial_offset: u64,
    ) -> Self {
        // Skip forward by reading; sequential files cannot seek.
        let mut to_skip = initial_offset;
        let mut scratch = [0_u8; 4096];
        while to_skip > 0 {
            let chunk = scratch.len().min(to_skip as usize);
            match file.read(&mut scratch[..chunk]) {
                Ok(0) | Err(_) => break,
                Ok(read) => to_skip -= read as u64,
            }
        }

        let mut reader = Self::new(file, reporter);
        reader.resyncing = initial_offset > 0;
        reader
    }

    /// The next logical record, or `None` at end of file.
    pub(crate) fn read_record(&mut self) -> Option<Vec<u8>> {
        // Buffer for fragments of the logical record being assembled.
        let mut assembled: Option<Vec<u8>> = None;

        loop {
            match self.read_physical_record() {
                Physical::Record(type_byte, payload) => match RecordType::from_byte(type_byte) {
                    Some(RecordType::Full) => {
                        if self.resyncing {
                            self.resyncing = false;
                        }
                        if let Some(partial) = assembled.take() {
                            self.reporter
                                .corruption(partial.len(), "partial record without end");
                        }
                        return Some(payload);
                    }
                    Some(RecordType::First) => {
                        if self.resyncing {
                            self.resyncing = false;
                        }
                        if let Some(partial) = assembled.take() {
                            self.reporter
                                .corruption(partial.len(), "partial record without end");
                        }
                        assembled = Some(payload);
                    }
                    Some(RecordType::Middle) => {
                        if self.resyncing {
                            // Continuation of a record that started before
                            // our initial offset; not an error.
                        } else if let Some(assembled) = &mut assembled {
                            assembled.extend_from_slice(&payload);
                        } else {
                            self.reporter
                                .corruption(payload.len(), "missing start of fragmented record");
                        }
                    }
                    Some(RecordType::Last) => {
                        if self.resyncing {
                            // As above; the record is not ours to return.
                        } else if let Some(mut record) = assembled.take() {
                            record.extend_from_slice(&payload);
                            return Some(record);
                        } else {
                            self.reporter
                                .corruption(payload.len(), "missing start of fragmented record");
                        }
                    }
                    Some(RecordType::Zero) | None => {
                        let dropped = payload.len()
                            + assembled.as_ref().map_or(0, Vec::len);
                        assembled = None;
                        self.reporter.corruption(dropped, "unknown record type");
                    }
                },
                Physical::BadRecord => {
                    if let Some(partial) = assembled.take() {
                        self.reporter
                            .corruption(partial.len(), "error in middle of record");
                    }
                }
                Physical::Eof => {
                    // A pending fragmented record at EOF means the writer
                    // crashed mid-append; drop it without a report.
                    return None;
                }
            }
        }
    }

    fn read_physical_record(&mut self) -> Physical {
        loop {
            let available = self.buffer.len() - self.buffer_offset;
            if available < LOG_HEADER_SIZE {
                if !self.reached_eof {
                    // Any sub-header remainder is trailer padding; read the
                    // next block.
                    if let Err(err) = self.fill_buffer() {
                        self.reporter.corruption(LOG_BLOCK_SIZE, &err.to_string());
                        self.reached_eof = true;
                        return Physical::Eof;
                    }
                    continue;
                }
                // A truncated header at EOF is a crashed write; not
                // reported.
                return Physical::Eof;
            }

            let header = &self.buffer[self.buffer_offset..];
            let stored_checksum = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let payload_len = u16::from_le_bytes(header[4..6].try_into().unwrap()) as usize;
            let type_byte = header[6];

            if LOG_HEADER_SIZE + payload_len > available {
                if !self.reached_eof {
                    // The declared length overruns the block we read; the
                    // writer never wrote such a record.
                    self.reporter.corruption(available, "bad record length");
                    self.buffer_offset = self.buffer.len();
                    continue;
                }
                // Truncated payload at EOF: crashed write, not reported.
                return Physical::Eof;
            }

            if type_byte == RecordType::Zero as u8 && payload_len == 0 {
                // Zero-filled trailer or preallocation; skip silently.
                self.buffer_offset += LOG_HEADER_SIZE;
                continue;
            }

            let payload_start = self.buffer_offset + LOG_HEADER_SIZE;
            let payload = &self.buffer[payload_start..payload_start + payload_len];

            let mut checksum = crc32c::crc32c(&[type_byte]);
            checksum = crc32c::crc32c_append(checksum, payload);
            if checksum != unmask_checksum(stored_checksum) {
                // Drop the rest of the block: the length field itself may be
                // lying.
                let dropped = available;
                self.buffer_offset = self.buffer.len();
                self.reporter.corruption(dropped, "checksum mismatch");
                return Physical::BadRecord;
            }

            let payload = payload.to_vec();
            self.buffer_offset += LOG_HEADER_SIZE + payload_len;
            return Physical::Record(type_byte, payload);
        }
    }

    fn fill_buffer(&mut self) -> std::io::Result<()> {
        self.buffer.clear();
        self.buffer.resize(LOG_BLOCK_SIZE, 0);
        self.buffer_offset = 0;

        let mut filled = 0;
        while filled < LOG_BLOCK_SIZE {
            let read = self.file.read(&mut self.buffer[filled..])?;
            if read == 0 {
                self.reached_eof = true;
                break;
            }
            filled += read;
        }
        self.buffer.truncate(filled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use strata_vfs::{FileSystem as _, MemFs};

    use crate::log::{LogWriter, LOG_BLOCK_SIZE};
    use super::*;


    #[derive(Default)]
    struct CountingReporter {
        reports: Vec<(usize, String)>,
    }

    impl LogReporter for &mut CountingReporter {
        fn corruption(&mut self, bytes: usize, reason: &str) {
            self.reports.push((bytes, reason.to_owned()));
        }
    }

    fn write_records(fs: &MemFs, path: &Path, records: &[&[u8]]) {
        let mut writer = LogWriter::new(fs.create(path).unwrap());
        for record in records {
            writer.add_record(record).unwrap();
        }
        writer.sync().unwrap();
    }

    fn read_all(fs: &MemFs, path: &Path) -> Vec<Vec<u8>> {
        let mut reader = LogReader::new(fs.open_sequential(path).unwrap(), ());
        let mut records = Vec::new();
        while let Some(record) = reader.read_record() {
            records.push(record);
        }
        records
    }

    #[test]
    fn small_records_round_trip() {
        let fs = MemFs::new();
        let path = Path::new("000003.log");
        write_records(&fs, path, &[b"one", b"two", b"", b"four"]);

        assert_eq!(read_all(&fs, path), vec![
            b"one".to_vec(),
            b"two".to_vec(),
            Vec::new(),
            b"four".to_vec(),
        ]);
    }

    #[test]
    fn large_record_fragments_across_blocks() {
        let fs = MemFs::new();
        let path = Path::new("000004.log");
        let big: Vec<u8> = (0..(3 * LOG_BLOCK_SIZE + 517)).map(|n| n as u8).collect();
        write_records(&fs, path, &[b"before", &big, b"after"]);

        let records = read_all(&fs, path);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], b"before");
        assert_eq!(records[1], big);
        assert_eq!(records[2], b"after");
    }

    #[test]
    fn block_boundary_padding() {
        let fs = MemFs::new();
        let path = Path::new("000005.log");
        // A record sized so the block has < 7 bytes left afterwards.
        let first = vec![7_u8; LOG_BLOCK_SIZE - LOG_HEADER_SIZE - 3];
        write_records(&fs, path, &[&first, b"second"]);

        let records = read_all(&fs, path);
        assert_eq!(records[0], first);
        assert_eq!(records[1], b"second");

        // The file is exactly one full block plus the second record.
        let file_size = fs.size_of(path).unwrap();
        assert_eq!(
            file_size,
            (LOG_BLOCK_SIZE + LOG_HEADER_SIZE + b"second".len()) as u64,
        );
    }

    #[test]
    fn single_bit_flip_is_detected_and_skipped() {
        let fs = MemFs::new();
        let path = Path::new("000006.log");
        write_records(&fs, path, &[b"healthy-1", b"damaged-record", b"healthy-2"]);

        // Flip one payload bit of the middle record.
        let mut contents = Vec::new();
        {
            use std::io::Read as _;
            fs.open_sequential(path).unwrap().read_to_end(&mut contents).unwrap();
        }
        let middle_payload_start = 2 * LOG_HEADER_SIZE + b"healthy-1".len() + 3;
        contents[middle_payload_start] ^= 0x40;
        {
            use std::io::Write as _;
            fs.create(path).unwrap().write_all(&contents).unwrap();
        }

        let mut reporter = CountingReporter::default();
        let mut reader = LogReader::new(fs.open_sequential(path).unwrap(), &mut reporter);
        let mut records = Vec::new();
        while let Some(record) = reader.read_record() {
            records.push(record);
        }
        drop(reader);

        // Checksumming drops everything from the damage to the block's end.
        assert_eq!(records, vec![b"healthy-1".to_vec()]);
        assert!(!reporter.reports.is_empty());
        assert!(reporter.reports[0].1.contains("checksum"));
    }

    #[test]
    fn truncated_tail_is_silently_dropped() {
        let fs = MemFs::new();
        let path = Path::new("000007.log");
        write_records(&fs, path, &[b"committed", b"torn-by-crash"]);

        let mut contents = Vec::new();
        {
            use std::io::Read as _;
            fs.open_sequential(path).unwrap().read_to_end(&mut contents).unwrap();
        }
        contents.truncate(contents.len() - 5);
        {
            use std::io::Write as _;
            fs.create(path).unwrap().write_all(&contents).unwrap();
        }

        let mut reporter = CountingReporter::default();
        let mut reader = LogReader::new(fs.open_sequential(path).unwrap(), &mut reporter);
        let mut records = Vec::new();
        while let Some(record) = reader.read_record() {
            records.push(record);
        }
        drop(reader);

        // Writer-crash semantics: the torn record vanishes, no report.
        assert_eq!(records, vec![b"committed".to_vec()]);
        assert!(reporter.reports.is_empty());
    }

    #[test]
    fn resync_drops_leading_continuations() {
        let fs = MemFs::new();
        let path = Path::new("000008.log");
        let big: Vec<u8> = vec![9; 2 * LOG_BLOCK_SIZE];
        write_records(&fs, path, &[&big, b"tail"]);

        // Start reading from the second block: inside the big record.
        let mut reader = LogReader::new_at_offset(
            fs.open_sequential(path).unwrap(),
            (),
            LOG_BLOCK_SIZE as u64,
        );
        let mut records = Vec::new();
        while let Some(record) = reader.read_record() {
            records.push(record);
        }

        assert_eq!(records, vec![b"tail".to_vec()]);
    }
}
