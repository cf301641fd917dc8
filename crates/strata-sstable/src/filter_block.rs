use crate::error::{TableError, TableResult};
use crate::filter::FilterPolicyRef;


/// One filter per 2 KiB of table offset space; fixed by the file format.
const FILTER_BASE_LOG2: u8 = 11;

/// Builds the filter block for a table: one filter per 2 KiB range of data
/// block offsets, each covering every key of the data blocks that start in
/// that range.
///
/// Call sequence: `start_block(offset)` before each data block is emitted,
/// `add_key` for each of its keys (in table order), and `finish` once after
/// the last block.
pub struct FilterBlockBuilder {
    policy:         FilterPolicyRef,
    /// Keys seen since the last filter was generated, flattened.
    flattened_keys: Vec<u8>,
    key_offsets:    Vec<usize>,
    /// Filter data generated so far.
    filters:        Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    #[must_use]
    pub fn new(policy: FilterPolicyRef) -> Self {
        Self {
            policy,
            flattened_keys: Vec::new(),
            key_offsets:    Vec::new(),
            filters:        Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    #[must_use]
    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Declare that the next data block will start at `block_offset`.
    /// Offsets must be non-decreasing across calls.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset >> FILTER_BASE_LOG2;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);

        while (self.filter_offsets.len() as u64) < filter_index {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.key_offsets.push(self.flattened_keys.len());
        self.flattened_keys.extend(key);
    }

    /// The length `finish` would currently return, for file-size estimates.
    /// Keys not yet folded into a filter are not counted.
    #[must_use]
    pub fn finished_length(&self) -> usize {
        // Filter data, one u32 per filter, the offset-array start, and the
        // base-log byte.
        self.filters.len() + 4 * self.filter_offsets.len() + 5
    }

    /// Produce the complete filter block: filters, the offset of each
    /// filter, the offset of that offset array, and the base log.
    #[must_use]
    pub fn finish(&mut self) -> &[u8] {
        if !self.key_offsets.is_empty() {
            self.generate_filter();
        }

        let offset_array_start = self.filters.len() as u32;
        for &offset in &self.filter_offsets {
            self.filters.extend(offset.to_le_bytes());
        }
        self.filters.extend(offset_array_start.to_le_bytes());
        self.filters.push(FILTER_BASE_LOG2);
        &self.filters
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.filters.len() as u32);
        if self.key_offsets.is_empty() {
            // The range had no data blocks; an empty filter slot suffices.
            return;
        }

        self.policy
            .create_filter(&self.flattened_keys, &self.key_offsets, &mut self.filters);
        self.flattened_keys.clear();
        self.key_offsets.clear();
    }
}

/// Reads a filter block produced by [`FilterBlockBuilder`].
pub struct FilterBlockReader {
    policy:             FilterPolicyRef,
    contents:           Vec<u8>,
    /// Byte offset of the filter-offset array within `contents`.
    offset_array_start: usize,
    num_filters:        usize,
    base_log2:          u8,
}

impl FilterBlockReader {
    pub fn new(policy: FilterPolicyRef, contents: Vec<u8>) -> TableResult<Self> {
        if contents.len() < 5 {
            return Err(TableError::corruption("filter block too short"));
        }

        let base_log2 = contents[contents.len() - 1];
        let offset_array_start = u32::from_le_bytes(
            contents[contents.len() - 5..contents.len() - 1].try_into().unwrap(),
        ) as usize;
        if offset_array_start > contents.len() - 5 {
            return Err(TableError::corruption("filter block offset array out of range"));
        }
        let num_filters = (contents.len() - 5 - offset_array_start) / 4;

        Ok(Self { policy, contents, offset_array_start, num_filters, base_log2 })
    }

    /// Whether `key` may be present in the data block starting at
    /// `block_offset`. Malformed filter data answers `true` (probe the
    /// block) rather than erroring.
    #[must_use]
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let filter_index = (block_offset >> self.base_log2) as usize;
        if filter_index >= self.num_filters {
            return true;
        }

        let start = self.read_offset(filter_index);
        // For the final filter this reads the offset-array-start word, which
        // equals the total filter data length; no sentinel entry is needed.
        let limit = self.read_offset(filter_index + 1);

        if start == limit {
            // A range with no data blocks holds no keys.
            return false;
        }
        if start > limit || limit > self.offset_array_start {
            return true;
        }

        self.policy.key_may_match(key, &self.contents[start..limit])
    }

    fn read_offset(&self, index: usize) -> usize {
        let at = self.offset_array_start + 4 * index;
        u32::from_le_bytes(self.contents[at..at + 4].try_into().unwrap()) as usize
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::filter::BloomFilterPolicy;
    use super::*;


    fn policy() -> FilterPolicyRef {
        Arc::new(BloomFilterPolicy::default())
    }

    #[test]
    fn single_range() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.start_block(200);
        builder.add_key(b"box");
        builder.start_block(300);
        builder.add_key(b"hello");

        let block = builder.finish().to_vec();
        let reader = FilterBlockReader::new(policy(), block).unwrap();

        for offset in [100, 200, 300] {
            assert!(reader.key_may_match(offset, b"foo"));
            assert!(reader.key_may_match(offset, b"bar"));
            assert!(reader.key_may_match(offset, b"box"));
            assert!(reader.key_may_match(offset, b"hello"));
        }
        assert!(!reader.key_may_match(100, b"missing"));
        assert!(!reader.key_may_match(100, b"other"));
    }

    #[test]
    fn multiple_ranges_are_independent() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.start_block(2000);
        builder.add_key(b"bar");
        builder.start_block(3100);
        builder.add_key(b"box");
        builder.start_block(9000);
        builder.add_key(b"hello");

        let block = builder.finish().to_vec();
        let reader = FilterBlockReader::new(policy(), block).unwrap();

        // Range [0, 2048): "foo" and "bar" both start below 2048.
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(2000, b"bar"));
        assert!(!reader.key_may_match(0, b"box"));
        assert!(!reader.key_may_match(0, b"hello"));

        // Range [2048, 4096): only "box".
        assert!(reader.key_may_match(3100, b"box"));
        assert!(!reader.key_may_match(3100, b"foo"));
        assert!(!reader.key_may_match(3100, b"hello"));

        // Ranges [4096, 8192) are empty; [8192, 10240) holds "hello".
        assert!(!reader.key_may_match(4100, b"foo"));
        assert!(!reader.key_may_match(6200, b"box"));
        assert!(reader.key_may_match(9000, b"hello"));
        assert!(!reader.key_may_match(9000, b"foo"));
    }

    #[test]
    fn empty_builder_produces_readable_block() {
        let mut builder = FilterBlockBuilder::new(policy());
        let block = builder.finish().to_vec();
        let reader = FilterBlockReader::new(policy(), block).unwrap();

        // No filters at all: every lookup must fall back to probing.
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(100_000, b"foo"));
    }

    #[test]
    fn truncated_block_is_rejected() {
        assert!(FilterBlockReader::new(policy(), vec![0, 0]).is_err());
    }
}
