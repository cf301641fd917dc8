use quick_cache::{sync::Cache, Weighter};

use crate::block::Block;


/// `(cache_id, block_offset)`. Each open table gets a process-unique cache
/// id, so entries of a deleted-and-reused file number can never be confused.
type CacheKey = (u64, u64);

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<CacheKey, Block> for BlockWeighter {
    fn weight(&self, _key: &CacheKey, block: &Block) -> u64 {
        block.heap_size() as u64
    }
}

/// A shared cache of decoded data blocks, weighted by block size and capped
/// in bytes. Thread-safe; one cache is typically shared by every table of a
/// database.
pub struct BlockCache {
    cache: Cache<CacheKey, Block, BlockWeighter>,
}

impl BlockCache {
    /// `capacity` is the total byte budget for cached block contents.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        // Estimate item slots assuming blocks near the common 4 KiB target.
        let estimated_items = usize::try_from(capacity / 4096).unwrap_or(usize::MAX).max(16);
        Self {
            cache: Cache::with_weighter(estimated_items, capacity, BlockWeighter),
        }
    }

    #[inline]
    pub fn insert(&self, cache_id: u64, block_offset: u64, block: Block) {
        self.cache.insert((cache_id, block_offset), block);
    }

    #[inline]
    #[must_use]
    pub fn get(&self, cache_id: u64, block_offset: u64) -> Option<Block> {
        self.cache.get(&(cache_id, block_offset))
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("len", &self.cache.len())
            .field("weight", &self.cache.weight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::block::BlockBuilder;
    use crate::comparator::BytewiseComparator;
    use super::*;


    fn tiny_block(tag: u8) -> Block {
        let mut builder = BlockBuilder::new(16);
        builder.add(&[tag], &[tag]);
        Block::new(builder.finish().to_vec(), Arc::new(BytewiseComparator)).unwrap()
    }

    #[test]
    fn hit_and_miss() {
        let cache = BlockCache::new(1 << 20);
        cache.insert(1, 0, tiny_block(7));

        assert!(cache.get(1, 0).is_some());
        assert!(cache.get(1, 4096).is_none());
        assert!(cache.get(2, 0).is_none());
    }

    #[test]
    fn capacity_evicts() {
        let cache = BlockCache::new(256);
        for offset in 0..64 {
            cache.insert(1, offset, tiny_block(offset as u8));
        }
        // A 256-byte budget cannot hold 64 blocks.
        let cached = (0..64).filter(|&offset| cache.get(1, offset).is_some()).count();
        assert!(cached < 64);
    }
}
