//! Filesystem interfaces for stratadb, plus two implementations: [`StdFs`],
//! backed by the operating system, and [`MemFs`], an in-memory filesystem
//! used primarily for tests.
//!
//! The database accesses every file through the dyn-compatible [`FileSystem`]
//! trait, so a database can be pointed at any storage that can implement the
//! handful of operations below.

mod mem_fs;
mod std_fs;
mod traits;

pub use self::mem_fs::MemFs;
pub use self::std_fs::StdFs;
pub use self::traits::{
    FileLock, FileSystem, RandomAccessFile, SequentialFile, WritableFile,
};
