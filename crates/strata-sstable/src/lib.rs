//! Sorted string tables (SSTables) for stratadb.
//!
//! A table is an immutable file of key-sorted entries: prefix-compressed data
//! blocks, an optional filter block, a meta-index block naming the filter, an
//! index block mapping separator keys to data-block handles, and a fixed
//! footer ending in the table magic number.
//!
//! [`TableBuilder`] writes tables through a [`strata_vfs::WritableFile`];
//! [`Table`] reads them back through a [`strata_vfs::RandomAccessFile`],
//! optionally sharing a [`BlockCache`] of decoded blocks between tables.

mod block;
mod cache;
mod comparator;
mod compress;
mod error;
mod filter;
mod filter_block;
mod format;
mod iter;
mod table;
mod table_builder;

pub use self::block::{Block, BlockBuilder, BlockIter};
pub use self::cache::BlockCache;
pub use self::comparator::{BytewiseComparator, ComparatorRef, TableComparator};
pub use self::compress::Compression;
pub use self::error::{TableError, TableResult};
pub use self::filter::{BloomFilterPolicy, FilterPolicy, FilterPolicyRef};
pub use self::filter_block::{FilterBlockBuilder, FilterBlockReader};
pub use self::format::{
    mask_checksum, unmask_checksum, BlockHandle, Footer, BLOCK_TRAILER_LEN, FILTER_META_PREFIX,
    TABLE_MAGIC,
};
pub use self::iter::SeekableIterator;
pub use self::table::{ReadTableOptions, Table, TableIter};
pub use self::table_builder::{TableBuilder, WriteTableOptions};
