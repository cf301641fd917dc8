use integer_encoding::{VarInt as _, VarIntWriter as _};

use strata_skiplist::{OwnedIter, SkipList};
use strata_sstable::{SeekableIterator, TableComparator as _, TableResult};

use crate::format::{
    memtable_entry_internal_key, InternalKeyComparator, LookupKey, MemtableEntryComparator,
    ParsedInternalKey, SequenceNumber, ValueType,
};


/// The outcome of a memtable lookup for a user key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MemtableLookup {
    /// The newest visible entry is a value.
    Value(Vec<u8>),
    /// The newest visible entry is a tombstone; stop searching older
    /// sources.
    Deleted,
}

/// The in-memory write buffer: a skiplist of packed entries
/// (`varint32 internal_key_len | internal_key | varint32 value_len | value`)
/// ordered by internal key.
///
/// Writes are serialized by the write pipeline; readers are lock-free.
/// Cloning shares the underlying list; the immutable-memtable handoff is a
/// clone kept by the flusher while readers keep their own.
#[derive(Clone)]
pub(crate) struct MemTable {
    list: SkipList<MemtableEntryComparator>,
    cmp:  InternalKeyComparator,
}

impl MemTable {
    pub(crate) fn new(cmp: InternalKeyComparator) -> Self {
        Self {
            list: SkipList::new(MemtableEntryComparator { internal: cmp.clone() }),
            cmp,
        }
    }

    /// Insert one entry. The `(sequence, value_type)` pair must be unique
    /// across the life of the memtable; the write pipeline's sequence
    /// assignment guarantees it.
    pub(crate) fn add(
        &self,
        sequence:   SequenceNumber,
        value_type: ValueType,
        user_key:   &[u8],
        value:      &[u8],
    ) {
        let internal_key_len = user_key.len() + 8;
        let entry_len = (internal_key_len as u32).required_space()
            + internal_key_len
            + (value.len() as u32).required_space()
            + value.len();

        let inserted = self.list.insert_with(entry_len, |buffer| {
            let mut buffer = buffer;
            buffer.write_varint(internal_key_len as u32).expect("slice write");
            buffer[..user_key.len()].copy_from_slice(user_key);
            buffer[user_key.len()..user_key.len() + 8]
                .copy_from_slice(&crate::format::pack_tag(sequence, value_type).to_le_bytes());
            let mut buffer = &mut buffer[user_key.len() + 8..];
            buffer.write_varint(value.len() as u32).expect("slice write");
            buffer[..value.len()].copy_from_slice(value);
        });
        debug_assert!(inserted, "duplicate (sequence, type) inserted into memtable");
    }

    /// Find the newest entry for the lookup key's user key at or below its
    /// sequence. `None` means this memtable has nothing to say.
    pub(crate) fn get(&self, lookup_key: &LookupKey) -> Option<MemtableLookup> {
        let mut iter = self.list.iter();
        iter.seek(lookup_key.memtable_key());

        let entry = iter.current()?;
        let (internal_key, value) = decode_memtable_entry(entry);
        let parsed = ParsedInternalKey::decode(internal_key)
            .expect("memtable entries are always well-formed");

        if self.cmp.user.cmp(parsed.user_key, lookup_key.user_key()).is_ne() {
            return None;
        }

        match parsed.value_type {
            ValueType::Value => Some(MemtableLookup::Value(value.to_vec())),
            ValueType::Deletion => Some(MemtableLookup::Deleted),
        }
    }

    /// Arena bytes behind this memtable; drives the flush trigger.
    #[inline]
    pub(crate) fn approximate_memory_usage(&self) -> usize {
        self.list.allocated_bytes()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        let mut iter = self.list.iter();
        iter.seek_to_first();
        !iter.valid()
    }

    /// An iterator over internal-key/value pairs, in internal-key order.
    /// Holds the memtable's storage alive on its own.
    pub(crate) fn iter(&self) -> MemTableIter {
        MemTableIter {
            iter:    self.list.owned_iter(),
            scratch: Vec::new(),
        }
    }
}

/// Split a packed memtable entry into its internal key and value.
fn decode_memtable_entry(entry: &[u8]) -> (&[u8], &[u8]) {
    let (key_len, key_prefix_len) =
        u32::decode_var(entry).expect("malformed memtable entry");
    let key_end = key_prefix_len + key_len as usize;
    let internal_key = &entry[key_prefix_len..key_end];

    let (value_len, value_prefix_len) =
        u32::decode_var(&entry[key_end..]).expect("malformed memtable entry");
    let value_start = key_end + value_prefix_len;
    let value = &entry[value_start..value_start + value_len as usize];

    (internal_key, value)
}

/// Iterator over a memtable, presenting entries as internal-key/value pairs.
pub(crate) struct MemTableIter {
    iter:    OwnedIter<MemtableEntryComparator>,
    /// Seek targets must be length-prefixed like stored entries.
    scratch: Vec<u8>,
}

impl SeekableIterator for MemTableIter {
    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        // `target` is an internal key; wrap it in the memtable framing.
        self.scratch.clear();
        self.scratch
            .write_varint(target.len() as u32)
            .expect("vec write");
        self.scratch.extend_from_slice(target);
        self.iter.seek(&self.scratch);
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.iter.next();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        self.iter.prev();
    }

    fn key(&self) -> &[u8] {
        let entry = self.iter.current().expect("key() on invalid iterator");
        memtable_entry_internal_key(entry)
    }

    fn value(&self) -> &[u8] {
        let entry = self.iter.current().expect("value() on invalid iterator");
        decode_memtable_entry(entry).1
    }

    fn status(&self) -> TableResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::format::DefaultComparator;
    use super::*;


    fn memtable() -> MemTable {
        MemTable::new(InternalKeyComparator::new(Arc::new(DefaultComparator::default())))
    }

    #[test]
    fn add_then_get() {
        let mem = memtable();
        mem.add(100, ValueType::Value, b"foo", b"bar");

        assert_eq!(
            mem.get(&LookupKey::new(b"foo", 100)),
            Some(MemtableLookup::Value(b"bar".to_vec())),
        );
        // Visible to later sequences too.
        assert_eq!(
            mem.get(&LookupKey::new(b"foo", 500)),
            Some(MemtableLookup::Value(b"bar".to_vec())),
        );
        // Invisible before it was written.
        assert_eq!(mem.get(&LookupKey::new(b"foo", 99)), None);
        assert_eq!(mem.get(&LookupKey::new(b"other", 100)), None);
    }

    #[test]
    fn newest_visible_entry_wins() {
        let mem = memtable();
        mem.add(10, ValueType::Value, b"k", b"v1");
        mem.add(20, ValueType::Value, b"k", b"v2");
        mem.add(30, ValueType::Deletion, b"k", b"");

        assert_eq!(mem.get(&LookupKey::new(b"k", 15)), Some(MemtableLookup::Value(b"v1".to_vec())));
        assert_eq!(mem.get(&LookupKey::new(b"k", 20)), Some(MemtableLookup::Value(b"v2".to_vec())));
        assert_eq!(mem.get(&LookupKey::new(b"k", 29)), Some(MemtableLookup::Value(b"v2".to_vec())));
        assert_eq!(mem.get(&LookupKey::new(b"k", 30)), Some(MemtableLookup::Deleted));
        assert_eq!(mem.get(&LookupKey::new(b"k", 1_000_000)), Some(MemtableLookup::Deleted));
    }

    #[test]
    fn empty_values_and_keys() {
        let mem = memtable();
        mem.add(1, ValueType::Value, b"", b"");
        assert_eq!(mem.get(&LookupKey::new(b"", 1)), Some(MemtableLookup::Value(Vec::new())));
    }

    #[test]
    fn iterates_in_internal_key_order() {
        let mem = memtable();
        mem.add(3, ValueType::Value, b"b", b"vb");
        mem.add(1, ValueType::Value, b"a", b"va-old");
        mem.add(2, ValueType::Value, b"a", b"va-new");

        let mut iter = mem.iter();
        iter.seek_to_first();

        // "a" entries first (user order), newest sequence first.
        let first = ParsedInternalKey::decode(iter.key()).unwrap();
        assert_eq!((first.user_key, first.sequence), (&b"a"[..], 2));
        assert_eq!(iter.value(), b"va-new");
        iter.next();

        let second = ParsedInternalKey::decode(iter.key()).unwrap();
        assert_eq!((second.user_key, second.sequence), (&b"a"[..], 1));
        iter.next();

        let third = ParsedInternalKey::decode(iter.key()).unwrap();
        assert_eq!(third.user_key, b"b");
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn memory_usage_grows() {
        let mem = memtable();
        assert!(mem.is_empty());
        let before = mem.approximate_memory_usage();
        mem.add(1, ValueType::Value, b"key", &[0_u8; 1000]);
        assert!(!mem.is_empty());
        assert!(mem.approximate_memory_usage() >= before + 1000);
    }
}
