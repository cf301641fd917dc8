use integer_encoding::{VarInt as _, VarIntWriter as _};

use crate::error::{Error, Result};
use crate::format::{SequenceNumber, ValueType};
use crate::memtable::MemTable;


/// Sequence (8 bytes, little-endian) followed by the operation count
/// (4 bytes, little-endian).
const BATCH_HEADER_LEN: usize = 12;

/// An atomic group of writes.
///
/// The in-memory representation is exactly the WAL payload: header, then
/// one record per operation (`type_byte || key [|| value]`, both
/// length-prefixed). Group commit concatenates batches by appending their
/// records and summing their counts.
#[derive(Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// One operation in a batch, borrowing its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchOp<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self { rep: vec![0; BATCH_HEADER_LEN] }
    }

    /// Reinterpret a WAL record as a batch. Validated lazily during
    /// iteration.
    pub(crate) fn from_contents(contents: Vec<u8>) -> Result<Self> {
        if contents.len() < BATCH_HEADER_LEN {
            return Err(Error::corruption("write batch record too short"));
        }
        Ok(Self { rep: contents })
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_LEN, 0);
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        self.append_length_prefixed(key);
        self.append_length_prefixed(value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        self.append_length_prefixed(key);
    }

    /// Number of operations in the batch.
    #[must_use]
    pub fn count(&self) -> u32 {
        u32::from_le_bytes(self.rep[8..12].try_into().unwrap())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// The on-wire size, which is also the in-memory size.
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    pub(crate) fn sequence(&self) -> SequenceNumber {
        u64::from_le_bytes(self.rep[0..8].try_into().unwrap())
    }

    pub(crate) fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.rep[0..8].copy_from_slice(&sequence.to_le_bytes());
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    /// Append every operation of `other` to `self` (group commit).
    pub(crate) fn append(&mut self, other: &Self) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_LEN..]);
    }

    /// The WAL payload.
    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Apply every operation to `memtable`, assigning sequence numbers
    /// `base_sequence`, `base_sequence + 1`, ... in batch order.
    pub(crate) fn insert_into(&self, memtable: &MemTable, base_sequence: SequenceNumber) -> Result<()> {
        let mut sequence = base_sequence;
        for op in self.iter() {
            match op? {
                BatchOp::Put { key, value } => {
                    memtable.add(sequence, ValueType::Value, key, value);
                }
                BatchOp::Delete { key } => {
                    memtable.add(sequence, ValueType::Deletion, key, &[]);
                }
            }
            sequence += 1;
        }
        Ok(())
    }

    pub(crate) fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            input:     &self.rep[BATCH_HEADER_LEN..],
            remaining: self.count(),
        }
    }

    fn append_length_prefixed(&mut self, bytes: &[u8]) {
        self.rep.write_varint(bytes.len() as u32).expect("vec write");
        self.rep.extend_from_slice(bytes);
    }
}

impl std::fmt::Debug for WriteBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatch")
            .field("count", &self.count())
            .field("size", &self.rep.len())
            .finish()
    }
}

/// Decodes batch records one at a time, verifying counts and lengths.
pub(crate) struct BatchIter<'a> {
    input:     &'a [u8],
    remaining: u32,
}

impl<'a> BatchIter<'a> {
    fn read_length_prefixed(&mut self) -> Result<&'a [u8]> {
        let (len, prefix_len) = u32::decode_var(self.input)
            .ok_or_else(|| Error::corruption("bad length prefix in write batch"))?;
        let end = prefix_len + len as usize;
        if end > self.input.len() {
            return Err(Error::corruption("write batch slice overruns record"));
        }
        let bytes = &self.input[prefix_len..end];
        self.input = &self.input[end..];
        Ok(bytes)
    }

    fn next_op(&mut self) -> Result<BatchOp<'a>> {
        let (&type_byte, rest) = self
            .input
            .split_first()
            .ok_or_else(|| Error::corruption("write batch shorter than its count"))?;
        self.input = rest;

        match ValueType::from_tag_byte(type_byte)? {
            ValueType::Value => {
                let key = self.read_length_prefixed()?;
                let value = self.read_length_prefixed()?;
                Ok(BatchOp::Put { key, value })
            }
            ValueType::Deletion => {
                let key = self.read_length_prefixed()?;
                Ok(BatchOp::Delete { key })
            }
        }
    }
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchOp<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            // Trailing junk after the counted records is corruption.
            if !self.input.is_empty() {
                self.input = &[];
                return Some(Err(Error::corruption("write batch has trailing bytes")));
            }
            return None;
        }
        self.remaining -= 1;
        match self.next_op() {
            Ok(op) => Some(Ok(op)),
            Err(err) => {
                self.remaining = 0;
                self.input = &[];
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use strata_sstable::SeekableIterator as _;

    use crate::format::{
        DefaultComparator, InternalKeyComparator, ParsedInternalKey, ValueType,
    };
    use super::*;


    /// Render a batch the way the memtable will see it: apply it at its
    /// sequence, then walk the memtable in internal-key order.
    fn contents_of(batch: &WriteBatch) -> String {
        let memtable = MemTable::new(InternalKeyComparator::new(Arc::new(
            DefaultComparator::default(),
        )));
        batch.insert_into(&memtable, batch.sequence()).unwrap();

        let mut rendered = String::new();
        let mut iter = memtable.iter();
        iter.seek_to_first();
        while iter.valid() {
            let parsed = ParsedInternalKey::decode(iter.key()).unwrap();
            let key = String::from_utf8_lossy(parsed.user_key);
            match parsed.value_type {
                ValueType::Value => {
                    let value = String::from_utf8_lossy(iter.value());
                    rendered.push_str(&format!("Put({key}, {value})@{}", parsed.sequence));
                }
                ValueType::Deletion => {
                    rendered.push_str(&format!("Delete({key})@{}", parsed.sequence));
                }
            }
            iter.next();
        }
        rendered
    }

    #[test]
    fn empty_batch() {
        let batch = WriteBatch::new();
        assert_eq!(batch.count(), 0);
        assert!(batch.is_empty());
        assert_eq!(contents_of(&batch), "");
    }

    #[test]
    fn multiple_operations_in_sequence_order() {
        let mut batch = WriteBatch::new();
        batch.put(b"foo", b"bar");
        batch.delete(b"box");
        batch.put(b"baz", b"boo");
        batch.set_sequence(100);

        assert_eq!(batch.count(), 3);
        assert_eq!(
            contents_of(&batch),
            "Put(baz, boo)@102Delete(box)@101Put(foo, bar)@100",
        );
    }

    #[test]
    fn append_merges_counts_and_records() {
        let mut lead = WriteBatch::new();
        lead.put(b"a", b"va");
        lead.set_sequence(200);

        let mut follower = WriteBatch::new();
        follower.put(b"b", b"vb");
        follower.delete(b"a");

        lead.append(&follower);
        assert_eq!(lead.count(), 3);
        assert_eq!(
            contents_of(&lead),
            "Delete(a)@202Put(a, va)@200Put(b, vb)@201",
        );
    }

    #[test]
    fn round_trip_through_contents() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        batch.delete(b"gone");
        batch.set_sequence(42);

        let restored = WriteBatch::from_contents(batch.contents().to_vec()).unwrap();
        assert_eq!(restored.sequence(), 42);
        assert_eq!(restored.count(), 2);

        let ops: Vec<_> = restored.iter().collect::<Result<_>>().unwrap();
        assert_eq!(ops[0], BatchOp::Put { key: b"key", value: b"value" });
        assert_eq!(ops[1], BatchOp::Delete { key: b"gone" });
    }

    #[test]
    fn corrupt_batches_error_out() {
        assert!(WriteBatch::from_contents(vec![0; 4]).is_err());

        // Count says one record, but there are no record bytes.
        let mut rep = vec![0_u8; BATCH_HEADER_LEN];
        rep[8] = 1;
        let batch = WriteBatch::from_contents(rep).unwrap();
        assert!(batch.iter().any(|op| op.is_err()));

        // Trailing junk beyond the declared count.
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        let mut rep = batch.contents().to_vec();
        rep.push(0xee);
        let batch = WriteBatch::from_contents(rep).unwrap();
        assert!(batch.iter().any(|op| op.is_err()));
    }

    #[test]
    fn approximate_size_tracks_wire_size() {
        let mut batch = WriteBatch::new();
        let empty_size = batch.approximate_size();
        assert_eq!(empty_size, 12);

        batch.put(b"four", b"five5");
        // 1 type byte + (1+4) key + (1+5) value.
        assert_eq!(batch.approximate_size(), empty_size + 12);
    }
}
