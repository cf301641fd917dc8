use std::cmp::Ordering;
use std::sync::Arc;

use integer_encoding::{VarInt as _, VarIntWriter as _};

use crate::comparator::{common_prefix_len, ComparatorRef};
use crate::error::{TableError, TableResult};
use crate::iter::SeekableIterator;


const U32_LEN: usize = size_of::<u32>();

/// Builds the byte contents of a [`Block`].
///
/// Entries must be added in strictly increasing key order under the
/// comparator the block will be read with; the builder does not check.
/// Every `restart_interval` entries the key prefix compression is reset and
/// the entry's offset recorded, so that readers can binary-search and walk
/// backwards.
#[derive(Debug)]
pub struct BlockBuilder {
    buffer:           Vec<u8>,
    last_key:         Vec<u8>,
    num_entries:      usize,
    restarts:         Vec<u32>,
    restart_counter:  usize,
    restart_interval: usize,
}

impl BlockBuilder {
    /// # Panics
    /// Panics if `restart_interval` is zero.
    #[must_use]
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval > 0, "restart interval must be at least 1");
        Self {
            buffer:           Vec::new(),
            last_key:         Vec::new(),
            num_entries:      0,
            restarts:         Vec::new(),
            restart_counter:  0,
            restart_interval,
        }
    }

    #[inline]
    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    #[inline]
    #[must_use]
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// The exact length `finish` would return now.
    #[must_use]
    pub fn finished_length(&self) -> usize {
        self.buffer.len() + U32_LEN * (self.restarts.len().max(1) + 1)
    }

    /// `key` must be strictly greater than every previously added key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.restart_counter % self.restart_interval == 0 {
            // First entry after construction/reset always lands here, so the
            // restart array is never empty.
            self.restarts.push(self.buffer.len() as u32);
            self.restart_counter = 1;
            0
        } else {
            self.restart_counter += 1;
            common_prefix_len(&self.last_key, key)
        };
        let non_shared = &key[shared..];

        self.buffer.write_varint(shared as u32).expect("vec write");
        self.buffer.write_varint(non_shared.len() as u32).expect("vec write");
        self.buffer.write_varint(value.len() as u32).expect("vec write");
        self.buffer.extend(non_shared);
        self.buffer.extend(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(non_shared);
        self.num_entries += 1;
    }

    /// Append the restart array and its length, returning the complete block
    /// contents. `reset` must be called before reusing the builder.
    #[must_use]
    pub fn finish(&mut self) -> &[u8] {
        if self.restarts.is_empty() {
            // Even an empty block carries one restart so readers always see
            // a well-formed restart array.
            self.restarts.push(0);
        }
        for restart in &self.restarts {
            self.buffer.extend(restart.to_le_bytes());
        }
        self.buffer.extend((self.restarts.len() as u32).to_le_bytes());
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_key.clear();
        self.num_entries = 0;
        self.restarts.clear();
        self.restart_counter = 0;
    }
}

/// An immutable, parsed block: entry bytes plus the restart array. Cloning
/// shares the contents.
#[derive(Clone)]
pub struct Block {
    data:            Arc<Vec<u8>>,
    /// Offset where entry data ends and the restart array begins.
    restarts_offset: usize,
    num_restarts:    usize,
    cmp:             ComparatorRef,
}

impl Block {
    pub fn new(contents: Vec<u8>, cmp: ComparatorRef) -> TableResult<Self> {
        if contents.len() < U32_LEN {
            return Err(TableError::corruption("block too short for restart count"));
        }

        let num_restarts = u32::from_le_bytes(
            contents[contents.len() - U32_LEN..].try_into().unwrap(),
        ) as usize;
        let non_entry_len = (num_restarts + 1) * U32_LEN;
        if num_restarts == 0 || non_entry_len > contents.len() {
            return Err(TableError::corruption("bad block restart array"));
        }

        Ok(Self {
            restarts_offset: contents.len() - non_entry_len,
            num_restarts,
            data: Arc::new(contents),
            cmp,
        })
    }

    /// Heap bytes held by the block, for cache weighting.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn iter(&self) -> BlockIter {
        BlockIter {
            block:         self.clone(),
            current:       self.restarts_offset,
            restart_index: self.num_restarts,
            key:           Vec::new(),
            value_start:   0,
            value_len:     0,
            status:        None,
        }
    }

    fn restart_point(&self, index: usize) -> usize {
        let at = self.restarts_offset + U32_LEN * index;
        u32::from_le_bytes(self.data[at..at + U32_LEN].try_into().unwrap()) as usize
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("len", &self.data.len())
            .field("num_restarts", &self.num_restarts)
            .finish_non_exhaustive()
    }
}

/// Header of one block entry: the three varint-encoded lengths.
#[derive(Clone, Copy)]
struct EntryHeader {
    shared:     usize,
    non_shared: usize,
    value_len:  usize,
    header_len: usize,
}

/// Iterator over a [`Block`], owning a shared handle to its contents.
pub struct BlockIter {
    block:         Block,
    /// Offset of the current entry; `restarts_offset` when invalid.
    current:       usize,
    /// Restart region containing `current`; `num_restarts` when invalid.
    restart_index: usize,
    /// The current key, reassembled from shared prefixes.
    key:           Vec<u8>,
    value_start:   usize,
    value_len:     usize,
    status:        Option<TableError>,
}

impl BlockIter {
    /// Offset one past the current entry's value.
    fn next_entry_offset(&self) -> usize {
        if self.current >= self.block.restarts_offset {
            self.block.restarts_offset
        } else {
            self.value_start + self.value_len
        }
    }

    fn corrupt(&mut self, detail: &str) {
        self.status = Some(TableError::corruption(format!(
            "block entry at offset {}: {detail}",
            self.current
        )));
        self.invalidate();
    }

    fn invalidate(&mut self) {
        self.current = self.block.restarts_offset;
        self.restart_index = self.block.num_restarts;
        self.key.clear();
        self.value_len = 0;
    }

    fn decode_header(&self, offset: usize) -> Option<EntryHeader> {
        let data = &self.block.data[..self.block.restarts_offset];
        let (shared, shared_len) = u32::decode_var(data.get(offset..)?)?;
        let (non_shared, non_shared_len) = u32::decode_var(data.get(offset + shared_len..)?)?;
        let (value_len, value_len_len) =
            u32::decode_var(data.get(offset + shared_len + non_shared_len..)?)?;

        Some(EntryHeader {
            shared:     shared as usize,
            non_shared: non_shared as usize,
            value_len:  value_len as usize,
            header_len: shared_len + non_shared_len + value_len_len,
        })
    }

    /// Move to the entry at `next_entry_offset`, reassembling its key.
    /// Returns false (invalidating) at the end of the block or on corruption.
    fn parse_next_entry(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.block.restarts_offset {
            self.invalidate();
            return false;
        }

        let Some(header) = self.decode_header(self.current) else {
            self.corrupt("bad entry header");
            return false;
        };

        let key_start = self.current + header.header_len;
        let entry_end = key_start + header.non_shared + header.value_len;
        if header.shared > self.key.len() || entry_end > self.block.restarts_offset {
            self.corrupt("entry overruns block");
            return false;
        }

        self.key.truncate(header.shared);
        self.key
            .extend_from_slice(&self.block.data[key_start..key_start + header.non_shared]);
        self.value_start = key_start + header.non_shared;
        self.value_len = header.value_len;

        while self.restart_index + 1 < self.block.num_restarts
            && self.block.restart_point(self.restart_index + 1) < self.current
        {
            self.restart_index += 1;
        }
        true
    }

    fn seek_to_restart_point(&mut self, restart_index: usize) {
        self.restart_index = restart_index;
        self.key.clear();
        // Make `next_entry_offset` produce the restart offset itself.
        self.current = self.block.restart_point(restart_index);
        self.value_start = self.current;
        self.value_len = 0;
    }

    /// Key of the entry at a restart point, where nothing is shared.
    fn restart_key(&self, restart_index: usize) -> Option<&[u8]> {
        let offset = self.block.restart_point(restart_index);
        let header = self.decode_header(offset)?;
        if header.shared != 0 {
            return None;
        }
        let key_start = offset + header.header_len;
        self.block
            .data
            .get(key_start..key_start + header.non_shared)
    }
}

impl SeekableIterator for BlockIter {
    fn valid(&self) -> bool {
        self.status.is_none() && self.current < self.block.restarts_offset
    }

    fn seek_to_first(&mut self) {
        if self.block.restarts_offset == 0 {
            self.invalidate();
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        if self.block.restarts_offset == 0 {
            self.invalidate();
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts - 1);
        // Walk to the final entry of the final restart region.
        while self.parse_next_entry() && self.next_entry_offset() < self.block.restarts_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.block.restarts_offset == 0 {
            self.invalidate();
            return;
        }

        // Binary search: greatest restart whose key is < target.
        let mut left = 0_usize;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let Some(mid_key) = self.restart_key(mid) else {
                self.corrupt("bad restart entry");
                return;
            };
            if self.block.cmp.cmp(mid_key, target) == Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        self.seek_to_restart_point(left);
        // Linear scan forward to the first key >= target.
        while self.parse_next_entry() {
            if self.block.cmp.cmp(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;

        // Back up to the restart region strictly before the current entry.
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                self.invalidate();
                return;
            }
            self.restart_index -= 1;
        }

        // Scan forward within the region to the entry preceding `original`.
        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_entry() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_start..self.value_start + self.value_len]
    }

    fn status(&self) -> TableResult<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::comparator::BytewiseComparator;
    use super::*;


    fn cmp() -> ComparatorRef {
        Arc::new(BytewiseComparator)
    }

    fn sample_block(restart_interval: usize) -> Block {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in [
            (&b"apple"[..], &b"red"[..]),
            (b"apricot", b"orange"),
            (b"banana", b"yellow"),
            (b"blueberry", b"blue"),
            (b"cherry", b"darkred"),
            (b"citron", b"green"),
        ] {
            builder.add(key, value);
        }
        Block::new(builder.finish().to_vec(), cmp()).unwrap()
    }

    #[test]
    fn builder_reports_sizes() {
        let mut builder = BlockBuilder::new(16);
        assert!(builder.is_empty());
        builder.add(b"key", b"value");
        assert_eq!(builder.last_key(), b"key");
        assert_eq!(builder.num_entries(), 1);

        let expected = builder.finished_length();
        assert_eq!(builder.finish().len(), expected);
    }

    #[test]
    fn forward_iteration() {
        for restart_interval in [1, 2, 16] {
            let block = sample_block(restart_interval);
            let mut iter = block.iter();

            iter.seek_to_first();
            let mut seen = Vec::new();
            while iter.valid() {
                seen.push((iter.key().to_vec(), iter.value().to_vec()));
                iter.next();
            }
            assert_eq!(seen.len(), 6);
            assert_eq!(seen[0].0, b"apple");
            assert_eq!(seen[2], (b"banana".to_vec(), b"yellow".to_vec()));
            assert_eq!(seen[5].0, b"citron");
            iter.status().unwrap();
        }
    }

    #[test]
    fn backward_iteration() {
        for restart_interval in [1, 3, 16] {
            let block = sample_block(restart_interval);
            let mut iter = block.iter();

            iter.seek_to_last();
            let mut seen = Vec::new();
            while iter.valid() {
                seen.push(iter.key().to_vec());
                iter.prev();
            }
            let mut forward = seen.clone();
            forward.reverse();
            assert_eq!(forward[0], b"apple");
            assert_eq!(seen.len(), 6);
        }
    }

    #[test]
    fn seek_behavior() {
        for restart_interval in [1, 2, 16] {
            let block = sample_block(restart_interval);
            let mut iter = block.iter();

            iter.seek(b"banana");
            assert_eq!(iter.key(), b"banana");

            iter.seek(b"bananaz");
            assert_eq!(iter.key(), b"blueberry");

            iter.seek(b"");
            assert_eq!(iter.key(), b"apple");

            iter.seek(b"zzz");
            assert!(!iter.valid());
        }
    }

    #[test]
    fn prefix_compression_restores_keys() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"the_quick_brown_fox", b"1");
        builder.add(b"the_quick_brown_foxtrot", b"2");
        builder.add(b"the_quick_red_fox", b"3");
        let block = Block::new(builder.finish().to_vec(), cmp()).unwrap();

        let mut iter = block.iter();
        iter.seek(b"the_quick_red_fox");
        assert_eq!(iter.key(), b"the_quick_red_fox");
        assert_eq!(iter.value(), b"3");
        iter.prev();
        assert_eq!(iter.key(), b"the_quick_brown_foxtrot");
    }

    #[test]
    fn empty_block_iterates_nowhere() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"only", b"entry");
        builder.reset();
        let block = Block::new(builder.finish().to_vec(), cmp()).unwrap();

        let mut iter = block.iter();
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek(b"only");
        assert!(!iter.valid());
    }

    #[test]
    fn truncated_contents_are_corrupt() {
        assert!(Block::new(vec![], cmp()).is_err());
        assert!(Block::new(vec![1, 0, 0], cmp()).is_err());
        // Restart count claiming more restarts than the block can hold.
        assert!(Block::new(vec![9, 0, 0, 0], cmp()).is_err());
    }
}
