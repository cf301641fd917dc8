use std::cmp::Ordering;
use std::sync::Arc;

use strata_vfs::RandomAccessFile;

use crate::block::{Block, BlockIter};
use crate::cache::BlockCache;
use crate::comparator::ComparatorRef;
use crate::compress::Compression;
use crate::error::{TableError, TableResult};
use crate::filter::FilterPolicyRef;
use crate::filter_block::FilterBlockReader;
use crate::format::{unmask_checksum, BlockHandle, Footer, BLOCK_TRAILER_LEN, FILTER_META_PREFIX};
use crate::iter::SeekableIterator;


/// Options governing how a table is opened and read.
#[derive(Clone)]
pub struct ReadTableOptions {
    pub comparator:       ComparatorRef,
    /// Must match the policy the table was written with (by name) for the
    /// filter to be used; otherwise lookups probe blocks directly.
    pub filter_policy:    Option<FilterPolicyRef>,
    pub block_cache:      Option<Arc<BlockCache>>,
    /// Process-unique id distinguishing this table's blocks in the cache.
    pub cache_id:         u64,
    pub verify_checksums: bool,
}

struct TableInner {
    file:        Box<dyn RandomAccessFile>,
    opts:        ReadTableOptions,
    index_block: Block,
    filter:      Option<FilterBlockReader>,
}

/// An open, immutable table file. Cloning shares the open file and parsed
/// index; clones are what iterators hold.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

impl Table {
    /// Open a table: verify the footer, then load the index block and (if a
    /// policy is configured and matches) the filter block.
    pub fn open(
        file:      Box<dyn RandomAccessFile>,
        file_size: u64,
        opts:      ReadTableOptions,
    ) -> TableResult<Self> {
        if (file_size as usize) < Footer::ENCODED_LEN {
            return Err(TableError::corruption("file too short to be a table"));
        }

        let mut footer_bytes = [0_u8; Footer::ENCODED_LEN];
        file.read_exact_at(file_size - Footer::ENCODED_LEN as u64, &mut footer_bytes)?;
        let footer = Footer::decode_from(&footer_bytes)?;

        let index_contents =
            read_block_contents(&*file, footer.index, opts.verify_checksums)?;
        let index_block = Block::new(index_contents, Arc::clone(&opts.comparator))?;

        let filter = match &opts.filter_policy {
            Some(policy) => read_filter(&*file, footer, policy, opts.verify_checksums)?,
            None => None,
        };

        Ok(Self {
            inner: Arc::new(TableInner { file, opts, index_block, filter }),
        })
    }

    /// Find the first entry with key `>= key`, consulting the filter first.
    ///
    /// Returns the entry's key and value; the caller decides whether the key
    /// actually matches what it was looking for.
    pub fn get(&self, key: &[u8]) -> TableResult<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = self.inner.index_block.iter();
        index_iter.seek(key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let (handle, _) = BlockHandle::decode_from(index_iter.value())?;

        if let Some(filter) = &self.inner.filter {
            if !filter.key_may_match(handle.offset, key) {
                return Ok(None);
            }
        }

        let block = self.read_data_block(handle)?;
        let mut block_iter = block.iter();
        block_iter.seek(key);
        if !block_iter.valid() {
            block_iter.status()?;
            return Ok(None);
        }
        Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())))
    }

    /// An approximate file offset for `key`: where its data block starts, or
    /// the start of the table's metadata for keys past the end.
    #[must_use]
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index_iter = self.inner.index_block.iter();
        index_iter.seek(key);
        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
                return handle.offset;
            }
        }
        // Past the last key (or undecodable): everything but the footer.
        self.inner
            .file
            .len()
            .map(|len| len.saturating_sub(Footer::ENCODED_LEN as u64))
            .unwrap_or(0)
    }

    /// A two-level iterator over every entry in the table.
    #[must_use]
    pub fn iter(&self) -> TableIter {
        TableIter {
            table:       self.clone(),
            index_iter:  self.inner.index_block.iter(),
            data_iter:   None,
            data_handle: None,
            status:      None,
        }
    }

    /// Read the data block behind `handle`, through the block cache when one
    /// is configured.
    fn read_data_block(&self, handle: BlockHandle) -> TableResult<Block> {
        let inner = &self.inner;

        if let Some(cache) = &inner.opts.block_cache {
            if let Some(block) = cache.get(inner.opts.cache_id, handle.offset) {
                return Ok(block);
            }
        }

        let contents =
            read_block_contents(&*inner.file, handle, inner.opts.verify_checksums)?;
        let block = Block::new(contents, Arc::clone(&inner.opts.comparator))?;

        if let Some(cache) = &inner.opts.block_cache {
            cache.insert(inner.opts.cache_id, handle.offset, block.clone());
        }
        Ok(block)
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("cache_id", &self.inner.opts.cache_id)
            .field("index_block", &self.inner.index_block)
            .finish_non_exhaustive()
    }
}

/// Read one block's raw contents, verify its trailer, and decompress.
fn read_block_contents(
    file:             &dyn RandomAccessFile,
    handle:           BlockHandle,
    verify_checksums: bool,
) -> TableResult<Vec<u8>> {
    let on_disk_len = handle.size as usize + BLOCK_TRAILER_LEN;
    let mut raw = vec![0_u8; on_disk_len];
    file.read_exact_at(handle.offset, &mut raw)?;

    let (data, trailer) = raw.split_at(handle.size as usize);
    let compression_id = trailer[0];
    let stored_checksum = u32::from_le_bytes(trailer[1..5].try_into().unwrap());

    if verify_checksums {
        let mut checksum = crc32c::crc32c(data);
        checksum = crc32c::crc32c_append(checksum, &[compression_id]);
        if checksum != unmask_checksum(stored_checksum) {
            return Err(TableError::corruption(format!(
                "block checksum mismatch at offset {}",
                handle.offset
            )));
        }
    }

    let compression = Compression::from_id(compression_id)?;
    let mut contents = Vec::new();
    compression.decode(data, &mut contents)?;
    Ok(contents)
}

/// Locate and load the filter block named by the meta-index, if its policy
/// name matches the configured policy.
fn read_filter(
    file:             &dyn RandomAccessFile,
    footer:           Footer,
    policy:           &FilterPolicyRef,
    verify_checksums: bool,
) -> TableResult<Option<FilterBlockReader>> {
    let metaindex_contents = read_block_contents(file, footer.metaindex, verify_checksums)?;
    // The meta-index is tiny and always bytewise-ordered, regardless of the
    // table's comparator.
    let metaindex = Block::new(
        metaindex_contents,
        Arc::new(crate::comparator::BytewiseComparator),
    )?;

    let mut name = Vec::from(FILTER_META_PREFIX);
    name.extend(policy.name().as_bytes());

    let mut iter = metaindex.iter();
    iter.seek(&name);
    if !iter.valid() || iter.key() != name.as_slice() {
        return Ok(None);
    }

    let (handle, _) = BlockHandle::decode_from(iter.value())?;
    let filter_contents = read_block_contents(file, handle, verify_checksums)?;
    FilterBlockReader::new(Arc::clone(policy), filter_contents).map(Some)
}

/// Two-level iterator: an outer iterator over index entries and an inner
/// iterator over the entries of the pointed-to data block.
pub struct TableIter {
    table:       Table,
    index_iter:  BlockIter,
    data_iter:   Option<BlockIter>,
    /// Handle of the block `data_iter` is over, to skip redundant reloads.
    data_handle: Option<BlockHandle>,
    status:      Option<TableError>,
}

impl TableIter {
    /// Point `data_iter` at the block the index currently references.
    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            self.data_handle = None;
            return;
        }

        let handle = match BlockHandle::decode_from(self.index_iter.value()) {
            Ok((handle, _)) => handle,
            Err(err) => {
                self.status = Some(err);
                self.data_iter = None;
                self.data_handle = None;
                return;
            }
        };

        if self.data_handle == Some(handle) && self.data_iter.is_some() {
            return;
        }

        match self.table.read_data_block(handle) {
            Ok(block) => {
                self.data_iter = Some(block.iter());
                self.data_handle = Some(handle);
            }
            Err(err) => {
                self.status = Some(err);
                self.data_iter = None;
                self.data_handle = None;
            }
        }
    }

    /// Advance through index entries until the data iterator is valid.
    fn skip_empty_blocks_forward(&mut self) {
        while !self.data_iter.as_ref().is_some_and(BlockIter::valid) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                self.data_handle = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(data_iter) = &mut self.data_iter {
                data_iter.seek_to_first();
            }
        }
    }

    /// Step back through index entries until the data iterator is valid.
    fn skip_empty_blocks_backward(&mut self) {
        while !self.data_iter.as_ref().is_some_and(BlockIter::valid) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                self.data_handle = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(data_iter) = &mut self.data_iter {
                data_iter.seek_to_last();
            }
        }
    }
}

impl SeekableIterator for TableIter {
    fn valid(&self) -> bool {
        self.status.is_none() && self.data_iter.as_ref().is_some_and(BlockIter::valid)
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek_to_first();
        }
        self.skip_empty_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek_to_last();
        }
        self.skip_empty_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        // The index key is a separator >= every key in its block, so the
        // first index entry >= target points at the candidate block.
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek(target);
        }
        self.skip_empty_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.next();
        }
        self.skip_empty_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.prev();
        }
        self.skip_empty_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("key() on invalid iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("value() on invalid iterator").value()
    }

    fn status(&self) -> TableResult<()> {
        if let Some(err) = &self.status {
            return Err(err.clone());
        }
        self.index_iter.status()?;
        if let Some(data_iter) = &self.data_iter {
            data_iter.status()?;
        }
        Ok(())
    }
}
