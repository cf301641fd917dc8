use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use quick_cache::sync::Cache;

use strata_sstable::{ReadTableOptions, Table, TableIter};
use strata_vfs::FileSystem;

use crate::error::Result;
use crate::filenames::DbFile;
use crate::format::{InternalFilterPolicy, InternalKeyComparator};
use crate::options::Options;


/// Process-wide source of block-cache ids, so tables opened at different
/// times (even for a reused file number) never collide in the block cache.
static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// An LRU cache of open tables, keyed by file number. Holding the handle
/// keeps the file open and its index/filter parsed.
pub(crate) struct TableCache {
    fs:          Arc<dyn FileSystem>,
    db_dir:      PathBuf,
    cache:       Cache<u64, Table>,
    icmp:        InternalKeyComparator,
    opts:        Options,
}

impl TableCache {
    pub(crate) fn new(
        fs:       Arc<dyn FileSystem>,
        db_dir:   PathBuf,
        icmp:     InternalKeyComparator,
        opts:     Options,
        capacity: usize,
    ) -> Self {
        Self {
            fs,
            db_dir,
            cache: Cache::new(capacity.max(1)),
            icmp,
            opts,
        }
    }

    /// The open table for `file_number`, from cache or freshly opened.
    pub(crate) fn table(&self, file_number: u64, file_size: u64) -> Result<Table> {
        if let Some(table) = self.cache.get(&file_number) {
            return Ok(table);
        }

        let table = self.open_table(file_number, file_size)?;
        self.cache.insert(file_number, table.clone());
        Ok(table)
    }

    /// An iterator over the table, for merges and the public iterator.
    pub(crate) fn iter(&self, file_number: u64, file_size: u64) -> Result<TableIter> {
        Ok(self.table(file_number, file_size)?.iter())
    }

    /// Point lookup: the first entry at-or-after `internal_key` in the
    /// table, filter permitting.
    pub(crate) fn get(
        &self,
        file_number:  u64,
        file_size:    u64,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.table(file_number, file_size)?;
        table.get(internal_key).map_err(Into::into)
    }

    /// Drop the cached handle for a deleted file.
    pub(crate) fn evict(&self, file_number: u64) {
        self.cache.remove(&file_number);
    }

    fn open_table(&self, file_number: u64, file_size: u64) -> Result<Table> {
        let path = DbFile::Table { number: file_number }.path_in(&self.db_dir);
        let file = match self.fs.open_random_access(&path) {
            Ok(file) => file,
            Err(_) => {
                // Fall back to the legacy extension before giving up.
                let legacy = DbFile::LegacyTable { number: file_number }.path_in(&self.db_dir);
                self.fs.open_random_access(&legacy)?
            }
        };

        let read_opts = ReadTableOptions {
            comparator:       Arc::new(self.icmp.clone()),
            filter_policy:    self
                .opts
                .filter_policy
                .clone()
                .map(|policy| Arc::new(InternalFilterPolicy::new(policy)) as _),
            block_cache:      self.opts.block_cache.clone(),
            cache_id:         NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            verify_checksums: true,
        };
        Table::open(file, file_size, read_opts).map_err(Into::into)
    }
}
