use std::sync::Arc;

use strata_sstable::{BlockCache, BloomFilterPolicy, Compression, FilterPolicyRef};
use strata_vfs::{FileSystem, StdFs};

use crate::format::{Comparator, DefaultComparator};
use crate::snapshot::Snapshot;


/// Options controlling a database's behavior, fixed at open.
#[derive(Clone)]
pub struct Options {
    /// Create the database directory and initial manifest if none exists.
    pub create_if_missing: bool,
    /// Fail `open` if the database already exists.
    pub error_if_exists: bool,
    /// Promote recoverable checksum mishaps (WAL tails, manifest records)
    /// to open-failures, and verify table checksums on every read.
    pub paranoid_checks: bool,

    /// The key ordering. Must match the comparator the database was created
    /// with, by name.
    pub comparator: Arc<dyn Comparator>,

    /// The filesystem everything is read and written through.
    pub fs: Arc<dyn FileSystem>,

    /// Bytes of memtable to accumulate before flushing to a level-0 table.
    pub write_buffer_size: usize,
    /// Budget of open table files; the table cache holds this many minus a
    /// small reserve for other file handles.
    pub max_open_files: usize,
    /// Uncompressed bytes per table data block.
    pub block_size: usize,
    /// Entries between restart points within a block.
    pub block_restart_interval: usize,
    /// Bytes at which a compaction output file is closed.
    pub max_file_size: u64,
    /// Per-block compression.
    pub compression: Compression,
    /// Reuse the tail WAL and manifest on open instead of rotating them.
    pub reuse_logs: bool,
    /// Filter policy for new tables (and for reading tables built with the
    /// same policy). `None` disables filters.
    pub filter_policy: Option<FilterPolicyRef>,
    /// Shared cache of decoded data blocks. `None` gives each database an
    /// 8 MiB private cache.
    pub block_cache: Option<Arc<BlockCache>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            comparator: Arc::new(DefaultComparator::default()),
            fs: Arc::new(StdFs),
            write_buffer_size: 4 << 20,
            max_open_files: 1000,
            block_size: 4 << 10,
            block_restart_interval: 16,
            max_file_size: 2 << 20,
            compression: Compression::Snappy,
            reuse_logs: false,
            filter_policy: Some(Arc::new(BloomFilterPolicy::default())),
            block_cache: None,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("comparator", &self.comparator.name())
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_open_files", &self.max_open_files)
            .field("block_size", &self.block_size)
            .field("block_restart_interval", &self.block_restart_interval)
            .field("max_file_size", &self.max_file_size)
            .field("compression", &self.compression)
            .field("reuse_logs", &self.reuse_logs)
            .finish_non_exhaustive()
    }
}

/// Options for one read.
#[derive(Default, Clone)]
pub struct ReadOptions {
    /// Read as of this snapshot instead of the current state.
    pub snapshot: Option<Snapshot>,
}

/// Options for one write.
#[derive(Default, Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Fsync the WAL before the write is acknowledged. Without it, a power
    /// failure may drop a suffix of recent writes; a mere process crash
    /// cannot.
    pub sync: bool,
}
