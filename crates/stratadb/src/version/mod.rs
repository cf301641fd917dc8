//! Versions: immutable snapshots of the level-set, the edit log that
//! persists them, and the compaction picker that evolves them.

mod edit;
mod set;
#[allow(clippy::module_inception)]
mod version;

pub(crate) use self::edit::VersionEdit;
pub(crate) use self::set::{set_current_file, Compaction, VersionSet};
pub(crate) use self::version::{
    find_file, some_file_overlaps_range, total_file_size, FileMetadata, FileMetadataParams,
    Version, VersionLookup,
};
