use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use parking_lot::Mutex;

use strata_sstable::TableComparator as _;

use crate::config::{
    ALLOWED_SEEKS_BYTES_PER_SEEK, L0_COMPACTION_TRIGGER, LEVEL_BYTES_MULTIPLIER,
    MAX_BYTES_FOR_LEVEL_BASE, MAX_MEM_COMPACT_LEVEL, MIN_ALLOWED_SEEKS, NUM_LEVELS,
};
use crate::error::Result;
use crate::format::{
    InternalKey, InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType, MAX_SEQUENCE,
    VALUE_TYPE_FOR_SEEK,
};
use crate::table_cache::TableCache;


/// Construction parameters for a table file's metadata, as carried by
/// version edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileMetadataParams {
    pub number:    u64,
    pub file_size: u64,
    pub smallest:  InternalKey,
    pub largest:   InternalKey,
}

/// Metadata for one on-disk table, shared by every version that contains
/// the file.
#[derive(Debug)]
pub(crate) struct FileMetadata {
    pub number:    u64,
    pub file_size: u64,
    /// Internal-key bounds; every key in the file lies within, inclusive.
    pub smallest:  InternalKey,
    pub largest:   InternalKey,
    /// Read misses this file may absorb before it volunteers for
    /// compaction. One seek is roughly the cost of compacting 16 KiB, so
    /// the budget is proportional to file size with a floor.
    allowed_seeks: AtomicI64,
}

impl FileMetadata {
    pub(crate) fn from_params(params: FileMetadataParams) -> Arc<Self> {
        let seeks = (params.file_size / ALLOWED_SEEKS_BYTES_PER_SEEK) as i64;
        Arc::new(Self {
            number:        params.number,
            file_size:     params.file_size,
            smallest:      params.smallest,
            largest:       params.largest,
            allowed_seeks: AtomicI64::new(seeks.max(MIN_ALLOWED_SEEKS)),
        })
    }

    pub(crate) fn params(&self) -> FileMetadataParams {
        FileMetadataParams {
            number:    self.number,
            file_size: self.file_size,
            smallest:  self.smallest.clone(),
            largest:   self.largest.clone(),
        }
    }

    /// Charge one seek; returns true when the budget just ran out.
    fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) == 1
    }
}

pub(crate) fn total_file_size(files: &[Arc<FileMetadata>]) -> u64 {
    files.iter().map(|file| file.file_size).sum()
}

/// Index of the first file in `files` (sorted by `smallest`, disjoint) whose
/// `largest` is at or past `internal_key`; `files.len()` if none.
pub(crate) fn find_file(
    icmp:         &InternalKeyComparator,
    files:        &[Arc<FileMetadata>],
    internal_key: &[u8],
) -> usize {
    let mut left = 0_usize;
    let mut right = files.len();
    while left < right {
        let mid = (left + right) / 2;
        if icmp.cmp(files[mid].largest.encoded(), internal_key) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

fn after_file(icmp: &InternalKeyComparator, user_key: Option<&[u8]>, file: &FileMetadata) -> bool {
    // None means "after every key".
    user_key.is_some_and(|user_key| {
        icmp.user.cmp(user_key, file.largest.user_key()) == Ordering::Greater
    })
}

fn before_file(icmp: &InternalKeyComparator, user_key: Option<&[u8]>, file: &FileMetadata) -> bool {
    user_key.is_some_and(|user_key| {
        icmp.user.cmp(user_key, file.smallest.user_key()) == Ordering::Less
    })
}

/// Whether any file's user-key range touches `[smallest, largest]` (either
/// bound `None` means unbounded). `disjoint` enables the binary-search fast
/// path valid on levels ≥ 1.
pub(crate) fn some_file_overlaps_range(
    icmp:          &InternalKeyComparator,
    disjoint:      bool,
    files:         &[Arc<FileMetadata>],
    smallest_user: Option<&[u8]>,
    largest_user:  Option<&[u8]>,
) -> bool {
    if !disjoint {
        return files.iter().any(|file| {
            !(after_file(icmp, smallest_user, file) || before_file(icmp, largest_user, file))
        });
    }

    let index = match smallest_user {
        Some(smallest_user) => {
            let small_key = InternalKey::new(smallest_user, MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK);
            find_file(icmp, files, small_key.encoded())
        }
        None => 0,
    };

    match files.get(index) {
        None => false,
        Some(file) => !before_file(icmp, largest_user, file),
    }
}

/// The final say of a read that fell through the memtables.
pub(crate) enum VersionLookup {
    Found(Vec<u8>),
    Deleted,
    NotFound,
}

/// An immutable snapshot of which files exist at which levels.
///
/// Level 0 is ordered newest file first (files may overlap); every other
/// level is ordered by smallest key, with disjoint user-key ranges.
pub(crate) struct Version {
    pub(super) files: [Vec<Arc<FileMetadata>>; NUM_LEVELS],
    icmp:             InternalKeyComparator,

    /// Level whose byte (or file-count) pressure is highest, and that
    /// pressure as a score; a score >= 1 invites compaction. Computed once
    /// when the version is installed.
    pub(super) compaction_score: f64,
    pub(super) compaction_level: usize,

    /// A file whose seek budget ran dry, waiting for seek-triggered
    /// compaction.
    seek_compaction: Mutex<Option<(usize, Arc<FileMetadata>)>>,
}

impl Version {
    pub(super) fn new(icmp: InternalKeyComparator) -> Self {
        Self {
            files: Default::default(),
            icmp,
            compaction_score: 0.0,
            compaction_level: 0,
            seek_compaction: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn files(&self, level: usize) -> &[Arc<FileMetadata>] {
        &self.files[level]
    }

    #[inline]
    pub(crate) fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Compute the compaction score: level 0 by file count (too many files
    /// makes every read consult every one), other levels by total bytes.
    pub(super) fn finalize(&mut self) {
        let mut best_level = 0;
        let mut best_score = -1.0_f64;

        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                self.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                total_file_size(&self.files[level]) as f64 / max_bytes_for_level(level)
            };

            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }

        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    pub(crate) fn needs_size_compaction(&self) -> bool {
        self.compaction_score >= 1.0
    }

    pub(crate) fn take_seek_compaction(&self) -> Option<(usize, Arc<FileMetadata>)> {
        self.seek_compaction.lock().take()
    }

    pub(crate) fn has_seek_compaction(&self) -> bool {
        self.seek_compaction.lock().is_some()
    }

    /// Every file whose range may contain `user_key`, newest-context first:
    /// overlapping level-0 files ordered newest-first, then at most one file
    /// per deeper level.
    fn for_each_candidate<F>(&self, user_key: &[u8], internal_key: &[u8], mut visit: F)
    where
        F: FnMut(usize, &Arc<FileMetadata>) -> bool,
    {
        // Level 0: every overlapping file, newest first. The level is
        // already sorted by file number descending.
        for file in &self.files[0] {
            let after = self.icmp.user.cmp(user_key, file.smallest.user_key()) == Ordering::Less;
            let before = self.icmp.user.cmp(user_key, file.largest.user_key()) == Ordering::Greater;
            if !after && !before && !visit(0, file) {
                return;
            }
        }

        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            let index = find_file(&self.icmp, files, internal_key);
            if let Some(file) = files.get(index) {
                let in_range =
                    self.icmp.user.cmp(user_key, file.smallest.user_key()) != Ordering::Less;
                if in_range && !visit(level, file) {
                    return;
                }
            }
        }
    }

    /// Look `lookup_key` up in the tables, newest first. Charges a seek
    /// against the first consulted file when more than one file had to be
    /// consulted, feeding seek-triggered compaction.
    pub(crate) fn get(
        &self,
        table_cache: &TableCache,
        lookup_key:  &LookupKey,
    ) -> Result<VersionLookup> {
        let user_key = lookup_key.user_key();
        let internal_key = lookup_key.internal_key();

        let mut first_consulted: Option<(usize, Arc<FileMetadata>)> = None;
        let mut consulted = 0_usize;
        let mut outcome: Result<VersionLookup> = Ok(VersionLookup::NotFound);

        self.for_each_candidate(user_key, internal_key, |level, file| {
            consulted += 1;
            if consulted == 1 {
                first_consulted = Some((level, Arc::clone(file)));
            }

            match table_cache.get(file.number, file.file_size, internal_key) {
                Err(err) => {
                    outcome = Err(err);
                    false
                }
                Ok(None) => true, // keep searching older files
                Ok(Some((found_key, value))) => {
                    let Ok(parsed) = ParsedInternalKey::decode(&found_key) else {
                        outcome = Err(crate::error::Error::corruption(
                            "undecodable internal key in table",
                        ));
                        return false;
                    };
                    if self.icmp.user.cmp(parsed.user_key, user_key) != Ordering::Equal {
                        // The table had nothing at this user key; the seek
                        // landed on a neighbor.
                        return true;
                    }
                    outcome = Ok(match parsed.value_type {
                        ValueType::Value => VersionLookup::Found(value),
                        ValueType::Deletion => VersionLookup::Deleted,
                    });
                    false
                }
            }
        });

        if consulted > 1 {
            // More than one file was touched for one user key: the first
            // one is earning its keep poorly.
            if let Some((level, file)) = first_consulted {
                if file.charge_seek() {
                    let mut pending = self.seek_compaction.lock();
                    if pending.is_none() {
                        *pending = Some((level, file));
                    }
                }
            }
        }

        outcome
    }

    /// Bill a read-sample at `internal_key` (from iterator sampling): if two
    /// or more files contain the key's range, charge the first. Returns
    /// true if that armed a seek compaction.
    pub(crate) fn record_read_sample(&self, internal_key: &[u8]) -> bool {
        let Ok(parsed) = ParsedInternalKey::decode(internal_key) else {
            return false;
        };

        let mut first: Option<(usize, Arc<FileMetadata>)> = None;
        let mut matches = 0_usize;
        self.for_each_candidate(parsed.user_key, internal_key, |level, file| {
            matches += 1;
            if matches == 1 {
                first = Some((level, Arc::clone(file)));
            }
            matches < 2
        });

        if matches >= 2 {
            if let Some((level, file)) = first {
                if file.charge_seek() {
                    let mut pending = self.seek_compaction.lock();
                    if pending.is_none() {
                        *pending = Some((level, file));
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Whether any file at `level` overlaps the user-key range.
    pub(crate) fn overlap_in_level(
        &self,
        level:         usize,
        smallest_user: Option<&[u8]>,
        largest_user:  Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user,
            largest_user,
        )
    }

    /// Where to place a flushed memtable covering `[smallest_user,
    /// largest_user]`: level 0 if it overlaps there, otherwise as deep as
    /// possible (bounded) while it overlaps nothing on the way down and
    /// little at the next level.
    pub(crate) fn pick_level_for_memtable_output(
        &self,
        smallest_user: &[u8],
        largest_user:  &[u8],
        max_file_size: u64,
    ) -> usize {
        if self.overlap_in_level(0, Some(smallest_user), Some(largest_user)) {
            return 0;
        }

        let start = InternalKey::new(smallest_user, MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK);
        let limit = InternalKey::new(largest_user, 0, ValueType::Deletion);

        let mut level = 0;
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, Some(smallest_user), Some(largest_user)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let grandparents = self.overlapping_inputs(level + 2, Some(&start), Some(&limit));
                if total_file_size(&grandparents)
                    > crate::config::GRANDPARENT_OVERLAP_FACTOR * max_file_size
                {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// All files at `level` overlapping `[begin, end]` in user-key space
    /// (either bound `None` = unbounded). On level 0 the range grows to
    /// cover transitively-overlapping files, since its files overlap one
    /// another.
    pub(crate) fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end:   Option<&InternalKey>,
    ) -> Vec<Arc<FileMetadata>> {
        let mut user_begin = begin.map(|key| key.user_key().to_vec());
        let mut user_end = end.map(|key| key.user_key().to_vec());

        let mut inputs = Vec::new();
        let mut index = 0;
        while index < self.files[level].len() {
            let file = &self.files[level][index];
            index += 1;

            let file_start = file.smallest.user_key();
            let file_limit = file.largest.user_key();

            let entirely_before = user_begin
                .as_deref()
                .is_some_and(|begin| self.icmp.user.cmp(file_limit, begin) == Ordering::Less);
            let entirely_after = user_end
                .as_deref()
                .is_some_and(|end| self.icmp.user.cmp(file_start, end) == Ordering::Greater);
            if entirely_before || entirely_after {
                continue;
            }

            inputs.push(Arc::clone(file));

            if level == 0 {
                // Level-0 files may overlap each other: if this file widens
                // the range, restart with the wider range.
                let widened_low = user_begin
                    .as_deref()
                    .is_some_and(|begin| self.icmp.user.cmp(file_start, begin) == Ordering::Less);
                let widened_high = user_end
                    .as_deref()
                    .is_some_and(|end| self.icmp.user.cmp(file_limit, end) == Ordering::Greater);

                if widened_low {
                    user_begin = Some(file_start.to_vec());
                }
                if widened_high {
                    user_end = Some(file_limit.to_vec());
                }
                if widened_low || widened_high {
                    inputs.clear();
                    index = 0;
                }
            }
        }
        inputs
    }

    /// One line per level with file counts, for the `stats` property.
    pub(crate) fn level_summary(&self) -> String {
        let mut summary = String::from("files[ ");
        for level in 0..NUM_LEVELS {
            summary.push_str(&format!("{} ", self.files[level].len()));
        }
        summary.push(']');
        summary
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut levels = f.debug_struct("Version");
        for level in 0..NUM_LEVELS {
            if !self.files[level].is_empty() {
                levels.field(
                    &format!("level{level}"),
                    &self.files[level]
                        .iter()
                        .map(|file| file.number)
                        .collect::<Vec<_>>(),
                );
            }
        }
        levels.finish_non_exhaustive()
    }
}

/// The byte budget for a level; level 1 gets the base, each deeper level
/// ten times more.
fn max_bytes_for_level(level: usize) -> f64 {
    let mut max_bytes = MAX_BYTES_FOR_LEVEL_BASE;
    let mut level = level;
    while level > 1 {
        max_bytes *= LEVEL_BYTES_MULTIPLIER;
        level -= 1;
    }
    max_bytes
}

#[cfg(test)]
mod tests {
    use crate::format::DefaultComparator;
    use super::*;


    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(DefaultComparator::default()))
    }

    fn file(number: u64, smallest: &[u8], largest: &[u8]) -> Arc<FileMetadata> {
        FileMetadata::from_params(FileMetadataParams {
            number,
            file_size: 10 << 20,
            smallest: InternalKey::new(smallest, 100, ValueType::Value),
            largest:  InternalKey::new(largest, 50, ValueType::Value),
        })
    }

    /// The disjoint sorted file set used throughout: ["150","200"],
    /// ["200","250"], ["300","350"], ["400","450"].
    fn sample_files() -> Vec<Arc<FileMetadata>> {
        vec![
            file(1, b"150", b"200"),
            file(2, b"200", b"250"),
            file(3, b"300", b"350"),
            file(4, b"400", b"450"),
        ]
    }

    fn seek_key(user_key: &[u8]) -> InternalKey {
        InternalKey::new(user_key, MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK)
    }

    #[test]
    fn find_file_boundaries() {
        let icmp = icmp();
        let files = sample_files();

        assert_eq!(find_file(&icmp, &files, seek_key(b"199").encoded()), 0);
        assert_eq!(find_file(&icmp, &files, seek_key(b"200").encoded()), 0);
        assert_eq!(find_file(&icmp, &files, seek_key(b"201").encoded()), 1);
        assert_eq!(find_file(&icmp, &files, seek_key(b"251").encoded()), 2);
        assert_eq!(find_file(&icmp, &files, seek_key(b"451").encoded()), 4);
        assert_eq!(find_file(&icmp, &files, seek_key(b"000").encoded()), 0);
    }

    #[test]
    fn range_overlap_boundaries() {
        let icmp = icmp();
        let files = sample_files();

        let overlaps = |begin: &[u8], end: &[u8]| {
            some_file_overlaps_range(&icmp, true, &files, Some(begin), Some(end))
        };

        assert!(!overlaps(b"100", b"149"));
        assert!(!overlaps(b"451", b"500"));
        assert!(overlaps(b"100", b"200"));
        assert!(overlaps(b"200", b"200"));
        assert!(overlaps(b"260", b"320"));
        assert!(!overlaps(b"251", b"299"));
        assert!(overlaps(b"450", b"500"));

        // Unbounded ends.
        assert!(some_file_overlaps_range(&icmp, true, &files, None, Some(b"150")));
        assert!(some_file_overlaps_range(&icmp, true, &files, Some(b"450"), None));
        assert!(!some_file_overlaps_range(&icmp, true, &files, Some(b"451"), None));
        assert!(some_file_overlaps_range(&icmp, true, &files, None, None));
    }

    #[test]
    fn level_zero_overlap_is_exhaustive() {
        let icmp = icmp();
        // Overlapping level-0 files: ranges [100,200] and [150,300].
        let files = vec![file(2, b"150", b"300"), file(1, b"100", b"200")];

        assert!(some_file_overlaps_range(&icmp, false, &files, Some(b"050"), Some(b"100")));
        assert!(some_file_overlaps_range(&icmp, false, &files, Some(b"250"), Some(b"350")));
        assert!(!some_file_overlaps_range(&icmp, false, &files, Some(b"301"), Some(b"400")));
    }

    #[test]
    fn allowed_seeks_floor() {
        let tiny = FileMetadata::from_params(FileMetadataParams {
            number: 9,
            file_size: 100,
            smallest: InternalKey::new(b"a", 1, ValueType::Value),
            largest:  InternalKey::new(b"b", 1, ValueType::Value),
        });
        // Small files still get the minimum budget.
        assert_eq!(tiny.allowed_seeks.load(AtomicOrdering::Relaxed), 100);

        let big = file(10, b"a", b"b");
        assert_eq!(
            big.allowed_seeks.load(AtomicOrdering::Relaxed),
            (10 << 20) / 16384,
        );
    }

    #[test]
    fn score_prefers_overfull_levels() {
        let icmp_value = icmp();
        let mut version = Version::new(icmp_value);
        // 5 level-0 files: score 5/4.
        version.files[0] = (0..5).map(|n| file(100 + n, b"a", b"z")).collect();
        version.finalize();

        assert_eq!(version.compaction_level, 0);
        assert!(version.compaction_score > 1.0);
        assert!(version.needs_size_compaction());
    }
}
