//! Fixed tuning constants. The configurable knobs live in
//! [`Options`](crate::Options); these are baked into the design.

/// Number of levels in the tree.
pub(crate) const NUM_LEVELS: usize = 7;

/// Level-0 file count that makes level 0 a size-compaction candidate.
pub(crate) const L0_COMPACTION_TRIGGER: usize = 4;
/// Level-0 file count at which each write is briefly delayed so compaction
/// can catch up.
pub(crate) const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;
/// Level-0 file count at which writes stop entirely until compaction
/// catches up.
pub(crate) const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Highest level a fresh memtable flush may be placed at, when it overlaps
/// nothing below.
pub(crate) const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Byte budget for level 1; each further level gets ten times more.
pub(crate) const MAX_BYTES_FOR_LEVEL_BASE: f64 = 10.0 * 1024.0 * 1024.0;
pub(crate) const LEVEL_BYTES_MULTIPLIER: f64 = 10.0;

/// A compaction's output file is cut when its overlap with level `L+2`
/// exceeds this many target-file-sizes, bounding future compactions.
pub(crate) const GRANDPARENT_OVERLAP_FACTOR: u64 = 10;
/// A level-`L` input is not expanded beyond this many target-file-sizes of
/// total input bytes.
pub(crate) const EXPANDED_COMPACTION_FACTOR: u64 = 25;

/// Fresh files may absorb this many read-misses before they become
/// seek-compaction candidates, at minimum.
pub(crate) const MIN_ALLOWED_SEEKS: i64 = 100;
/// One seek is charged per this many bytes of file size.
pub(crate) const ALLOWED_SEEKS_BYTES_PER_SEEK: u64 = 16 * 1024;

/// Iterators charge a seek against the file that served a key after about
/// this many bytes, feeding seek-triggered compaction.
pub(crate) const READ_BYTES_PERIOD: u64 = 1 << 20;

/// Group commit caps: a leader merges followers up to this total size,
pub(crate) const MAX_MERGED_WRITE_BYTES: usize = 1 << 20;
/// or up to this size when the leader's own batch is small, so small
/// writes aren't delayed behind huge group flushes.
pub(crate) const SMALL_MERGED_WRITE_BYTES: usize = 128 << 10;
pub(crate) const SMALL_WRITE_BYTES: usize = 128 << 10;
