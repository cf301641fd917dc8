use strata_vfs::WritableFile;

use crate::block::BlockBuilder;
use crate::comparator::ComparatorRef;
use crate::compress::Compression;
use crate::error::{TableError, TableResult};
use crate::filter::FilterPolicyRef;
use crate::filter_block::FilterBlockBuilder;
use crate::format::{mask_checksum, BlockHandle, Footer, FILTER_META_PREFIX};


/// Options governing how a table is written.
#[derive(Clone)]
pub struct WriteTableOptions {
    pub comparator:       ComparatorRef,
    pub filter_policy:    Option<FilterPolicyRef>,
    /// Uncompressed size at which a data block is cut.
    pub block_size:       usize,
    pub restart_interval: usize,
    pub compression:      Compression,
}

/// Writes a table file: data blocks as they fill, then the filter block,
/// meta-index, index, and footer on [`finish`].
///
/// Keys must be added in strictly increasing comparator order.
///
/// [`finish`]: TableBuilder::finish
pub struct TableBuilder<F: WritableFile> {
    file:           F,
    opts:           WriteTableOptions,
    offset:         u64,
    num_entries:    usize,

    data_block:     BlockBuilder,
    index_block:    BlockBuilder,
    filter_block:   Option<FilterBlockBuilder>,

    /// Handle of the last finished data block, waiting for the next key so
    /// its index separator can be computed.
    pending_handle: Option<BlockHandle>,
    last_key:       Vec<u8>,
    scratch:        Vec<u8>,
    compressed:     Vec<u8>,
}

impl<F: WritableFile> TableBuilder<F> {
    #[must_use]
    pub fn new(file: F, opts: WriteTableOptions) -> Self {
        let filter_block = opts
            .filter_policy
            .clone()
            .map(|policy| {
                let mut builder = FilterBlockBuilder::new(policy);
                builder.start_block(0);
                builder
            });

        Self {
            file,
            data_block: BlockBuilder::new(opts.restart_interval),
            index_block: BlockBuilder::new(opts.restart_interval),
            filter_block,
            opts,
            offset: 0,
            num_entries: 0,
            pending_handle: None,
            last_key: Vec::new(),
            scratch: Vec::new(),
            compressed: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Bytes written to the file so far, excluding the unfinished data block.
    #[inline]
    #[must_use]
    pub fn file_offset(&self) -> u64 {
        self.offset
    }

    /// An estimate of the final file size if `finish` were called now.
    #[must_use]
    pub fn estimated_file_size(&self) -> u64 {
        let pending = self.data_block.finished_length()
            + self.index_block.finished_length()
            + self.filter_block.as_ref().map_or(0, FilterBlockBuilder::finished_length)
            + Footer::ENCODED_LEN;
        self.offset + pending as u64
    }

    /// `key` must be strictly greater than every key added before it.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> TableResult<()> {
        debug_assert!(
            self.last_key.is_empty()
                || self.opts.comparator.cmp(&self.last_key, key) == std::cmp::Ordering::Less,
            "table keys added out of order",
        );

        // `key` bounds the just-finished block from above, so the pending
        // index entry can now use a short separator.
        self.write_pending_index_entry(Some(key));

        if let Some(filter_block) = &mut self.filter_block {
            filter_block.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.data_block.add(key, value);
        self.num_entries += 1;

        if self.data_block.finished_length() >= self.opts.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    /// Close the current data block and record where the next one starts.
    fn flush_data_block(&mut self) -> TableResult<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }

        let contents_handle = {
            let contents = self.data_block.finish();
            Self::write_block_to(
                &mut self.file,
                &mut self.offset,
                &mut self.compressed,
                contents,
                self.opts.compression,
            )?
        };
        self.data_block.reset();
        self.pending_handle = Some(contents_handle);

        if let Some(filter_block) = &mut self.filter_block {
            filter_block.start_block(self.offset);
        }
        Ok(())
    }

    /// Emit the deferred index entry for the last finished data block.
    ///
    /// With `Some(next_key)` the separator satisfies
    /// `last_key <= separator < next_key`; with `None` (end of table) it is a
    /// short successor of the final key.
    fn write_pending_index_entry(&mut self, next_key: Option<&[u8]>) {
        let Some(handle) = self.pending_handle.take() else {
            return;
        };

        self.scratch.clear();
        match next_key {
            Some(next_key) => {
                self.opts
                    .comparator
                    .find_short_separator(&self.last_key, next_key, &mut self.scratch);
            }
            None => {
                self.opts
                    .comparator
                    .find_short_successor(&self.last_key, &mut self.scratch);
            }
        }

        let mut encoded_handle = Vec::with_capacity(BlockHandle::MAX_ENCODED_LEN);
        handle.encode_to(&mut encoded_handle);
        self.index_block.add(&self.scratch, &encoded_handle);
    }

    /// Write the filter, meta-index, index, and footer, flush the file, and
    /// return the final file size. The builder must not be reused.
    pub fn finish(mut self, sync: bool) -> TableResult<u64> {
        self.flush_data_block()?;
        self.write_pending_index_entry(None);

        // Meta-index block: one entry per meta block; just the filter here.
        let mut metaindex_block = BlockBuilder::new(self.opts.restart_interval);
        if let Some(filter_block) = &mut self.filter_block {
            let mut name = Vec::from(FILTER_META_PREFIX);
            name.extend(filter_block.policy_name().as_bytes());

            // The filter block is never compressed; offsets inside it are
            // physical.
            let filter_contents = filter_block.finish();
            let filter_handle = Self::write_block_to(
                &mut self.file,
                &mut self.offset,
                &mut self.compressed,
                filter_contents,
                Compression::None,
            )?;

            let mut encoded_handle = Vec::with_capacity(BlockHandle::MAX_ENCODED_LEN);
            filter_handle.encode_to(&mut encoded_handle);
            metaindex_block.add(&name, &encoded_handle);
        }

        let metaindex = Self::write_block_to(
            &mut self.file,
            &mut self.offset,
            &mut self.compressed,
            metaindex_block.finish(),
            self.opts.compression,
        )?;

        let index = Self::write_block_to(
            &mut self.file,
            &mut self.offset,
            &mut self.compressed,
            self.index_block.finish(),
            self.opts.compression,
        )?;

        self.scratch.clear();
        Footer { metaindex, index }.encode_to(&mut self.scratch);
        self.file.write_all(&self.scratch).map_err(TableError::from)?;
        self.offset += Footer::ENCODED_LEN as u64;

        self.file.flush().map_err(TableError::from)?;
        if sync {
            self.file.sync_data().map_err(TableError::from)?;
        }
        Ok(self.offset)
    }

    /// Drop the builder without finishing; the file contents are not a valid
    /// table.
    pub fn abandon(self) {}

    /// Compress and write one block plus its trailer, returning its handle.
    fn write_block_to(
        file:        &mut F,
        offset:      &mut u64,
        compressed:  &mut Vec<u8>,
        contents:    &[u8],
        compression: Compression,
    ) -> TableResult<BlockHandle> {
        let written_compression = compression.encode(contents, compressed)?;

        let mut checksum = crc32c::crc32c(compressed);
        checksum = crc32c::crc32c_append(checksum, &[written_compression.id()]);

        file.write_all(compressed).map_err(TableError::from)?;
        file.write_all(&[written_compression.id()]).map_err(TableError::from)?;
        file.write_all(&mask_checksum(checksum).to_le_bytes()).map_err(TableError::from)?;

        let handle = BlockHandle { offset: *offset, size: compressed.len() as u64 };
        *offset += handle.size + crate::format::BLOCK_TRAILER_LEN as u64;
        Ok(handle)
    }
}
