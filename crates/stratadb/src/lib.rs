//! An embedded, single-process, ordered key/value store, organized as a
//! log-structured merge tree.
//!
//! Arbitrary byte-string keys map to byte-string values under a pluggable
//! total order. Writes are made durable through a write-ahead log, absorbed
//! by an in-memory skiplist, and migrated in the background into immutable
//! sorted table files arranged in levels. Reads consult the memtables and
//! tables newest-first; snapshots and iterators observe a frozen view.
//!
//! ```no_run
//! use stratadb::{Database, Options, ReadOptions, WriteOptions};
//!
//! let mut opts = Options::default();
//! opts.create_if_missing = true;
//! let db = Database::open("/tmp/demo-db", opts)?;
//!
//! db.put(&WriteOptions::default(), b"name", b"strata")?;
//! assert_eq!(db.get(&ReadOptions::default(), b"name")?, Some(b"strata".to_vec()));
//! # Ok::<(), stratadb::Error>(())
//! ```

mod config;
mod db;
mod error;
mod filenames;
mod format;
mod iterator;
mod log;
mod memtable;
mod options;
mod snapshot;
mod table_cache;
mod version;
mod write_batch;

pub use self::db::Database;
pub use self::error::{Error, ErrorKind, Result};
pub use self::format::{Comparator, DefaultComparator};
pub use self::iterator::DbIter;
pub use self::options::{Options, ReadOptions, WriteOptions};
pub use self::snapshot::Snapshot;
pub use self::write_batch::WriteBatch;

// The storage-layer types an embedder may want to configure or share.
pub use strata_sstable::{
    BlockCache, BloomFilterPolicy, Compression, FilterPolicy, TableComparator,
};
pub use strata_vfs::{FileSystem, MemFs, StdFs};
