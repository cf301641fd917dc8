use std::cmp::Ordering;
use std::sync::Arc;

use integer_encoding::{VarInt as _, VarIntWriter as _};

use strata_sstable::TableComparator;

use crate::error::{Error, Result};


/// Sequence numbers are 56-bit; the low 8 bits of a tag hold the entry type.
pub(crate) type SequenceNumber = u64;

pub(crate) const MAX_SEQUENCE: SequenceNumber = (1 << 56) - 1;

/// The kind of entry an internal key describes. `Deletion` sorts after
/// `Value` at the same sequence (tags order descending), which is never
/// observable because sequences are unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ValueType {
    Deletion = 0,
    Value    = 1,
}

impl ValueType {
    pub(crate) fn from_tag_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Deletion),
            1 => Ok(Self::Value),
            other => Err(Error::corruption(format!("unknown value type {other}"))),
        }
    }
}

/// When seeking at a sequence `s`, a lookup key uses the largest tag for
/// `s`, so it sorts before every entry of the same user key with sequence
/// `<= s`.
pub(crate) const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

#[inline]
pub(crate) fn pack_tag(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE);
    (sequence << 8) | value_type as u64
}

/// Append `user_key` and its 8-byte tag.
pub(crate) fn append_internal_key(
    output:     &mut Vec<u8>,
    user_key:   &[u8],
    sequence:   SequenceNumber,
    value_type: ValueType,
) {
    output.extend_from_slice(user_key);
    output.extend_from_slice(&pack_tag(sequence, value_type).to_le_bytes());
}

/// An internal key split into its parts, borrowing the user key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParsedInternalKey<'a> {
    pub user_key:   &'a [u8],
    pub sequence:   SequenceNumber,
    pub value_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    pub(crate) fn decode(encoded: &'a [u8]) -> Result<Self> {
        let (user_key, tag) = split_internal_key(encoded)?;
        let type_byte = (tag & 0xff) as u8;
        Ok(Self {
            user_key,
            sequence: tag >> 8,
            value_type: ValueType::from_tag_byte(type_byte)?,
        })
    }
}

fn split_internal_key(encoded: &[u8]) -> Result<(&[u8], u64)> {
    let user_key_len = encoded
        .len()
        .checked_sub(8)
        .ok_or_else(|| Error::corruption("internal key shorter than its tag"))?;
    let (user_key, tag_bytes) = encoded.split_at(user_key_len);
    let tag = u64::from_le_bytes(tag_bytes.try_into().unwrap());
    Ok((user_key, tag))
}

/// The user-key portion of an encoded internal key.
///
/// # Panics
/// Panics if `encoded` is shorter than a tag; internal keys from trusted
/// sources always carry one.
#[inline]
pub(crate) fn extract_user_key(encoded: &[u8]) -> &[u8] {
    debug_assert!(encoded.len() >= 8);
    &encoded[..encoded.len() - 8]
}

#[inline]
pub(crate) fn extract_tag(encoded: &[u8]) -> u64 {
    u64::from_le_bytes(encoded[encoded.len() - 8..].try_into().unwrap())
}

/// An owned, encoded internal key; what file metadata stores as its bounds.
#[derive(Clone, PartialEq, Eq, Default)]
pub(crate) struct InternalKey(Vec<u8>);

impl InternalKey {
    pub(crate) fn new(user_key: &[u8], sequence: SequenceNumber, value_type: ValueType) -> Self {
        let mut encoded = Vec::with_capacity(user_key.len() + 8);
        append_internal_key(&mut encoded, user_key, sequence, value_type);
        Self(encoded)
    }

    pub(crate) fn decode_from(encoded: &[u8]) -> Result<Self> {
        // Validate eagerly so a corrupt manifest fails at read time.
        ParsedInternalKey::decode(encoded)?;
        Ok(Self(encoded.to_vec()))
    }

    #[inline]
    pub(crate) fn encoded(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub(crate) fn user_key(&self) -> &[u8] {
        extract_user_key(&self.0)
    }

    #[inline]
    pub(crate) fn sequence(&self) -> SequenceNumber {
        extract_tag(&self.0) >> 8
    }
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match ParsedInternalKey::decode(&self.0) {
            Ok(parsed) => write!(
                f,
                "{:?}@{}:{:?}",
                String::from_utf8_lossy(parsed.user_key),
                parsed.sequence,
                parsed.value_type,
            ),
            Err(_) => write!(f, "<invalid internal key {:02x?}>", self.0),
        }
    }
}

/// A user-supplied key ordering: a [`TableComparator`] plus a stable name
/// recorded in the manifest so that a database is never opened with the
/// wrong order.
pub trait Comparator: TableComparator {
    fn name(&self) -> &'static str;
}

pub(crate) type UserComparatorRef = Arc<dyn Comparator>;

/// The default lexicographic ordering. The name deliberately matches the
/// on-disk name used by LevelDB so files are mutually intelligible.
#[derive(Default, Debug, Clone, Copy)]
pub struct DefaultComparator(strata_sstable::BytewiseComparator);

impl TableComparator for DefaultComparator {
    #[inline]
    fn cmp(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        self.0.cmp(lhs, rhs)
    }

    fn find_short_separator(&self, from: &[u8], to: &[u8], separator: &mut Vec<u8>) {
        self.0.find_short_separator(from, to, separator);
    }

    fn find_short_successor(&self, key: &[u8], successor: &mut Vec<u8>) {
        self.0.find_short_successor(key, successor);
    }
}

impl Comparator for DefaultComparator {
    #[inline]
    fn name(&self) -> &'static str {
        "leveldb.BytewiseComparator"
    }
}

/// Orders encoded internal keys: user key ascending (user comparator), then
/// tag descending, so the newest entry for a user key comes first.
#[derive(Clone)]
pub(crate) struct InternalKeyComparator {
    pub user: UserComparatorRef,
}

impl InternalKeyComparator {
    pub(crate) fn new(user: UserComparatorRef) -> Self {
        Self { user }
    }

    pub(crate) fn cmp_keys(&self, lhs: &InternalKey, rhs: &InternalKey) -> Ordering {
        self.cmp(lhs.encoded(), rhs.encoded())
    }
}

impl TableComparator for InternalKeyComparator {
    fn cmp(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        match self.user.cmp(extract_user_key(lhs), extract_user_key(rhs)) {
            Ordering::Equal => extract_tag(rhs).cmp(&extract_tag(lhs)),
            unequal => unequal,
        }
    }

    fn find_short_separator(&self, from: &[u8], to: &[u8], separator: &mut Vec<u8>) {
        let user_from = extract_user_key(from);
        let user_to = extract_user_key(to);

        let mut user_separator = Vec::new();
        self.user.find_short_separator(user_from, user_to, &mut user_separator);

        if user_separator.len() < user_from.len()
            && self.user.cmp(user_from, &user_separator) == Ordering::Less
        {
            // The user key shrank; give it the maximal tag so it still sorts
            // before every real entry with that user key.
            separator.extend_from_slice(&user_separator);
            separator
                .extend_from_slice(&pack_tag(MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK).to_le_bytes());
            debug_assert!(self.cmp(from, separator) == Ordering::Less);
            debug_assert!(self.cmp(separator, to) == Ordering::Less);
        } else {
            separator.extend_from_slice(from);
        }
    }

    fn find_short_successor(&self, key: &[u8], successor: &mut Vec<u8>) {
        let user_key = extract_user_key(key);

        let mut user_successor = Vec::new();
        self.user.find_short_successor(user_key, &mut user_successor);

        if user_successor.len() < user_key.len()
            && self.user.cmp(user_key, &user_successor) == Ordering::Less
        {
            successor.extend_from_slice(&user_successor);
            successor
                .extend_from_slice(&pack_tag(MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK).to_le_bytes());
            debug_assert!(self.cmp(key, successor) == Ordering::Less);
        } else {
            successor.extend_from_slice(key);
        }
    }
}

/// Adapts a user-key filter policy to tables that store internal keys:
/// keys are stripped to their user-key portion before the filter sees
/// them, so a lookup key's differing tag can't cause a false negative.
pub(crate) struct InternalFilterPolicy {
    user: strata_sstable::FilterPolicyRef,
}

impl InternalFilterPolicy {
    pub(crate) fn new(user: strata_sstable::FilterPolicyRef) -> Self {
        Self { user }
    }
}

impl strata_sstable::FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &'static str {
        self.user.name()
    }

    fn create_filter(&self, flattened_keys: &[u8], key_offsets: &[usize], filter: &mut Vec<u8>) {
        // Re-flatten with each key's 8-byte tag dropped.
        let mut user_keys = Vec::with_capacity(flattened_keys.len());
        let mut user_offsets = Vec::with_capacity(key_offsets.len());

        for (index, &start) in key_offsets.iter().enumerate() {
            let end = key_offsets
                .get(index + 1)
                .copied()
                .unwrap_or(flattened_keys.len());
            let internal_key = &flattened_keys[start..end];
            user_offsets.push(user_keys.len());
            user_keys.extend_from_slice(extract_user_key(internal_key));
        }

        self.user.create_filter(&user_keys, &user_offsets, filter);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user.key_may_match(extract_user_key(key), filter)
    }
}

/// Orders packed memtable entries (`varint32 key_len | internal_key | ...`)
/// by their internal-key component.
#[derive(Clone)]
pub(crate) struct MemtableEntryComparator {
    pub internal: InternalKeyComparator,
}

impl strata_skiplist::Comparator for MemtableEntryComparator {
    fn cmp(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        let lhs_key = memtable_entry_internal_key(lhs);
        let rhs_key = memtable_entry_internal_key(rhs);
        self.internal.cmp(lhs_key, rhs_key)
    }
}

/// The internal-key component of a packed memtable entry.
///
/// # Panics
/// Panics on malformed entries; entries only enter the skiplist through
/// the memtable's own encoder.
pub(crate) fn memtable_entry_internal_key(entry: &[u8]) -> &[u8] {
    let (key_len, prefix_len) =
        u32::decode_var(entry).expect("malformed memtable entry length");
    &entry[prefix_len..prefix_len + key_len as usize]
}

/// A key formatted for memtable and table lookups at a specific sequence:
/// `varint32(user_key len + 8) | user_key | tag(sequence, seek type)`.
pub(crate) struct LookupKey {
    buffer:             Vec<u8>,
    /// Where the internal key (user key + tag) begins.
    internal_key_start: usize,
}

impl LookupKey {
    pub(crate) fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let internal_key_len = user_key.len() + 8;
        let mut buffer = Vec::with_capacity(5 + internal_key_len);
        buffer
            .write_varint(internal_key_len as u32)
            .expect("vec write");
        let internal_key_start = buffer.len();
        append_internal_key(&mut buffer, user_key, sequence, VALUE_TYPE_FOR_SEEK);
        Self { buffer, internal_key_start }
    }

    /// The full length-prefixed form, comparable against skiplist entries.
    #[inline]
    pub(crate) fn memtable_key(&self) -> &[u8] {
        &self.buffer
    }

    #[inline]
    pub(crate) fn internal_key(&self) -> &[u8] {
        &self.buffer[self.internal_key_start..]
    }

    #[inline]
    pub(crate) fn user_key(&self) -> &[u8] {
        &self.buffer[self.internal_key_start..self.buffer.len() - 8]
    }
}

#[cfg(test)]
mod tests {
    use super::*;


    fn ikey(user_key: &[u8], sequence: u64, value_type: ValueType) -> Vec<u8> {
        let mut encoded = Vec::new();
        append_internal_key(&mut encoded, user_key, sequence, value_type);
        encoded
    }

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(DefaultComparator::default()))
    }

    #[test]
    fn internal_key_round_trip() {
        let encoded = ikey(b"foo", 100, ValueType::Value);
        let parsed = ParsedInternalKey::decode(&encoded).unwrap();
        assert_eq!(parsed.user_key, b"foo");
        assert_eq!(parsed.sequence, 100);
        assert_eq!(parsed.value_type, ValueType::Value);
    }

    #[test]
    fn ordering_is_user_asc_then_sequence_desc() {
        let cmp = icmp();

        // Same user key: higher sequence sorts first.
        assert_eq!(
            cmp.cmp(&ikey(b"k", 2, ValueType::Value), &ikey(b"k", 1, ValueType::Value)),
            Ordering::Less,
        );
        // Different user keys: user order dominates regardless of sequence.
        assert_eq!(
            cmp.cmp(&ikey(b"a", 1, ValueType::Value), &ikey(b"b", 999, ValueType::Value)),
            Ordering::Less,
        );
        // Same user key and sequence: Value sorts before Deletion... which
        // cannot happen with unique sequences, but the order must be total.
        assert_eq!(
            cmp.cmp(&ikey(b"k", 5, ValueType::Value), &ikey(b"k", 5, ValueType::Deletion)),
            Ordering::Less,
        );
    }

    #[test]
    fn lookup_key_sorts_before_older_entries() {
        let cmp = icmp();
        let lookup = LookupKey::new(b"foo", 10);

        // The lookup key must not sort after any entry with sequence <= 10.
        assert!(cmp.cmp(lookup.internal_key(), &ikey(b"foo", 10, ValueType::Value))
            != Ordering::Greater);
        assert_eq!(
            cmp.cmp(lookup.internal_key(), &ikey(b"foo", 9, ValueType::Value)),
            Ordering::Less,
        );
        // But after entries newer than the snapshot.
        assert_eq!(
            cmp.cmp(lookup.internal_key(), &ikey(b"foo", 11, ValueType::Value)),
            Ordering::Greater,
        );
        assert_eq!(lookup.user_key(), b"foo");
    }

    #[test]
    fn separator_keeps_internal_key_invariants() {
        let cmp = icmp();
        let from = ikey(b"abcdefghij", 100, ValueType::Value);
        let to = ikey(b"abzzz", 300, ValueType::Value);

        let mut separator = Vec::new();
        cmp.find_short_separator(&from, &to, &mut separator);
        assert!(separator.len() < from.len());
        assert_eq!(cmp.cmp(&from, &separator), Ordering::Less);
        assert_eq!(cmp.cmp(&separator, &to), Ordering::Less);
    }

    #[test]
    fn max_sequence_fits_in_tag() {
        let encoded = ikey(b"k", MAX_SEQUENCE, ValueType::Deletion);
        let parsed = ParsedInternalKey::decode(&encoded).unwrap();
        assert_eq!(parsed.sequence, MAX_SEQUENCE);
        assert_eq!(parsed.value_type, ValueType::Deletion);
    }
}
