use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tracing::{info, warn};

use strata_sstable::TableComparator as _;
use strata_vfs::{FileSystem, WritableFile};

use crate::config::{EXPANDED_COMPACTION_FACTOR, GRANDPARENT_OVERLAP_FACTOR, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::filenames::DbFile;
use crate::format::{InternalKey, InternalKeyComparator, SequenceNumber};
use crate::iterator::{BoxedIter, LevelIter, MergingIter};
use crate::log::{LogReader, LogReporter, LogWriter};
use crate::options::Options;
use crate::table_cache::TableCache;
use crate::version::{total_file_size, FileMetadata, Version, VersionEdit};


/// Owns the chain of versions and everything needed to persist them: file
/// number allocation, the manifest log, per-level compaction pointers, and
/// the compaction picker.
///
/// All mutation happens under the database mutex; reads of `current` clone
/// an `Arc` and proceed without it.
pub(crate) struct VersionSet {
    fs:     Arc<dyn FileSystem>,
    db_dir: PathBuf,
    opts:   Options,
    icmp:   InternalKeyComparator,

    pub(crate) table_cache: Arc<TableCache>,

    next_file_number:     u64,
    manifest_file_number: u64,
    last_sequence:        SequenceNumber,
    /// WAL in active use; logs numbered below it are obsolete.
    log_number:           u64,
    /// WAL of the memtable still being flushed, 0 when none.
    prev_log_number:      u64,

    current: Arc<Version>,
    /// Superseded versions that may still be pinned by iterators or
    /// in-flight reads; their files must survive obsolete-file sweeps.
    /// Pruned lazily as the handles drop.
    retired_versions: Vec<Weak<Version>>,
    /// Per level: the largest internal key compacted so far, so successive
    /// compactions rotate through the key space.
    compact_pointer: [Vec<u8>; NUM_LEVELS],

    manifest_log: Option<LogWriter<Box<dyn WritableFile>>>,
}

impl VersionSet {
    pub(crate) fn new(
        fs:          Arc<dyn FileSystem>,
        db_dir:      PathBuf,
        opts:        Options,
        icmp:        InternalKeyComparator,
        table_cache: Arc<TableCache>,
    ) -> Self {
        let mut empty = Version::new(icmp.clone());
        empty.finalize();

        Self {
            fs,
            db_dir,
            opts,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            current: Arc::new(empty),
            retired_versions: Vec::new(),
            compact_pointer: Default::default(),
            manifest_log: None,
        }
    }

    #[inline]
    pub(crate) fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    #[inline]
    pub(crate) fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub(crate) fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    #[inline]
    pub(crate) fn log_number(&self) -> u64 {
        self.log_number
    }

    #[inline]
    pub(crate) fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    #[inline]
    pub(crate) fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub(crate) fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Hand back an allocated-but-unused file number.
    pub(crate) fn reuse_file_number(&mut self, number: u64) {
        if number + 1 == self.next_file_number {
            self.next_file_number = number;
        }
    }

    pub(crate) fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    /// Every table file number referenced by any live version: the current
    /// one, plus superseded versions still held by readers.
    pub(crate) fn live_files(&mut self) -> HashSet<u64> {
        self.retired_versions.retain(|weak| weak.strong_count() > 0);

        let mut live = HashSet::new();
        let retired = self.retired_versions.iter().filter_map(Weak::upgrade);
        for version in retired.chain(std::iter::once(Arc::clone(&self.current))) {
            for level in 0..NUM_LEVELS {
                for file in version.files(level) {
                    live.insert(file.number);
                }
            }
        }
        live
    }

    /// Total bytes in a level of the current version.
    pub(crate) fn level_bytes(&self, level: usize) -> u64 {
        total_file_size(self.current.files(level))
    }

    // ================================================================
    //  Applying edits
    // ================================================================

    /// Apply `edit` to the current version, persist it in the manifest, and
    /// install the result. On success the new version is `current`.
    pub(crate) fn log_and_apply(&mut self, mut edit: VersionEdit) -> Result<()> {
        match edit.log_number {
            Some(number) => {
                debug_assert!(number >= self.log_number && number < self.next_file_number);
            }
            None => edit.log_number = Some(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.prev_log_number = Some(self.prev_log_number);
        }
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);

        let mut version = Version::new(self.icmp.clone());
        {
            let mut builder = Builder::new(&self.icmp, &self.current);
            builder.apply(&edit, &mut self.compact_pointer);
            builder.save_to(&mut version)?;
        }
        version.finalize();

        // First write after open (or after a failed manifest): start a new
        // manifest containing a snapshot of the whole state.
        let created_manifest = self.manifest_log.is_none();
        if created_manifest {
            let path = DbFile::Manifest { number: self.manifest_file_number }.path_in(&self.db_dir);
            let file = self.fs.create(&path)?;
            let mut writer = LogWriter::new(file);
            self.write_snapshot(&mut writer)?;
            self.manifest_log = Some(writer);
        }

        let mut record = Vec::new();
        edit.encode(&mut record);
        let manifest_log = self.manifest_log.as_mut().expect("manifest open");
        let append = manifest_log
            .add_record(&record)
            .and_then(|()| manifest_log.sync());

        if let Err(err) = append {
            warn!(error = %err, "manifest append failed");
            if created_manifest {
                self.manifest_log = None;
                let path =
                    DbFile::Manifest { number: self.manifest_file_number }.path_in(&self.db_dir);
                let _ = self.fs.remove_file(&path);
            }
            return Err(err.into());
        }

        if created_manifest {
            set_current_file(&*self.fs, &self.db_dir, self.manifest_file_number)?;
        }

        let retired = std::mem::replace(&mut self.current, Arc::new(version));
        self.retired_versions.push(Arc::downgrade(&retired));
        self.log_number = edit.log_number.expect("set above");
        self.prev_log_number = edit.prev_log_number.expect("set above");
        Ok(())
    }

    /// A full-state edit: comparator name, compaction pointers, and every
    /// file of the current version.
    fn write_snapshot(&self, writer: &mut LogWriter<Box<dyn WritableFile>>) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some(self.opts.comparator.name().to_owned());

        for (level, pointer) in self.compact_pointer.iter().enumerate() {
            if !pointer.is_empty() {
                edit.compact_pointers
                    .push((level, InternalKey::decode_from(pointer)?));
            }
        }
        for level in 0..NUM_LEVELS {
            for file in self.current.files(level) {
                edit.new_files.push((level, file.params()));
            }
        }

        let mut record = Vec::new();
        edit.encode(&mut record);
        writer.add_record(&record)?;
        Ok(())
    }

    // ================================================================
    //  Recovery
    // ================================================================

    /// Load the state named by `CURRENT`. Returns whether the caller must
    /// write a fresh manifest (we could not or chose not to reuse the old
    /// one).
    pub(crate) fn recover(&mut self) -> Result<bool> {
        let current_path = DbFile::Current.path_in(&self.db_dir);
        let mut current_contents = String::new();
        self.fs
            .open_sequential(&current_path)?
            .read_to_string(&mut current_contents)
            .map_err(|_| Error::corruption("CURRENT is not valid utf-8"))?;
        let manifest_name = current_contents
            .strip_suffix('\n')
            .ok_or_else(|| Error::corruption("CURRENT file has no newline"))?;
        let Some(DbFile::Manifest { number: manifest_number }) = DbFile::parse(manifest_name)
        else {
            return Err(Error::corruption(format!(
                "CURRENT names a non-manifest file: {manifest_name}"
            )));
        };

        let manifest_path = self.db_dir.join(manifest_name);
        let manifest_file = self.fs.open_sequential(&manifest_path)?;

        struct FailFast {
            error: Option<String>,
        }
        impl LogReporter for &mut FailFast {
            fn corruption(&mut self, _bytes: usize, reason: &str) {
                if self.error.is_none() {
                    self.error = Some(reason.to_owned());
                }
            }
        }

        let mut damage = FailFast { error: None };
        let mut reader = LogReader::new(manifest_file, &mut damage);

        let mut builder = Builder::new(&self.icmp, &self.current);
        let mut highest_log = None;
        let mut highest_prev_log = None;
        let mut highest_next_file = None;
        let mut highest_sequence = None;

        while let Some(record) = reader.read_record() {
            let edit = VersionEdit::decode(&record)?;

            if let Some(name) = &edit.comparator_name {
                if name != self.opts.comparator.name() {
                    return Err(Error::invalid_argument(format!(
                        "comparator mismatch: database uses {name}, options supply {}",
                        self.opts.comparator.name(),
                    )));
                }
            }

            builder.apply(&edit, &mut self.compact_pointer);

            if edit.log_number.is_some() {
                highest_log = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                highest_prev_log = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                highest_next_file = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                highest_sequence = edit.last_sequence;
            }
        }
        drop(reader);

        if let Some(reason) = damage.error {
            return Err(Error::corruption(format!("manifest damaged: {reason}")));
        }

        let next_file = highest_next_file
            .ok_or_else(|| Error::corruption("manifest has no next-file-number entry"))?;
        let log_number = highest_log
            .ok_or_else(|| Error::corruption("manifest has no log-number entry"))?;
        let last_sequence = highest_sequence
            .ok_or_else(|| Error::corruption("manifest has no last-sequence entry"))?;
        let prev_log_number = highest_prev_log.unwrap_or(0);

        self.next_file_number = next_file.max(log_number + 1).max(prev_log_number + 1);
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;

        let mut version = Version::new(self.icmp.clone());
        builder.save_to(&mut version)?;
        version.finalize();
        self.current = Arc::new(version);

        if self.reuse_manifest(&manifest_path, manifest_number)? {
            info!(manifest = manifest_number, "reusing manifest");
            Ok(false)
        } else {
            self.manifest_file_number = self.new_file_number();
            Ok(true)
        }
    }

    /// Keep appending to the recovered manifest when allowed and it has not
    /// outgrown one file's budget; a fresh manifest otherwise, so a bloated
    /// edit history is rolled into a single snapshot.
    fn reuse_manifest(&mut self, manifest_path: &std::path::Path, number: u64) -> Result<bool> {
        if !self.opts.reuse_logs {
            return Ok(false);
        }
        let size = self.fs.size_of(manifest_path)?;
        if size >= self.opts.max_file_size {
            return Ok(false);
        }

        let file = self.fs.append(manifest_path)?;
        self.manifest_log = Some(LogWriter::new_at_offset(file, size));
        self.manifest_file_number = number;
        Ok(true)
    }

    // ================================================================
    //  Compaction picking
    // ================================================================

    /// Choose the next compaction, if any work is warranted: size-triggered
    /// first, seek-triggered otherwise.
    pub(crate) fn pick_compaction(&mut self) -> Option<Compaction> {
        let version = self.current();

        let (level, initial_inputs) = if version.needs_size_compaction() {
            let level = version.compaction_level;
            debug_assert!(level + 1 < NUM_LEVELS);

            // Rotate through the level: first file past the compaction
            // pointer, wrapping to the front.
            let pointer = &self.compact_pointer[level];
            let chosen = version
                .files(level)
                .iter()
                .find(|file| {
                    pointer.is_empty()
                        || self.icmp.cmp(file.largest.encoded(), pointer) == Ordering::Greater
                })
                .or_else(|| version.files(level).first())?;

            (level, vec![Arc::clone(chosen)])
        } else {
            let (level, file) = version.take_seek_compaction()?;
            (level, vec![file])
        };

        let mut compaction = Compaction::new(
            &self.icmp,
            Arc::clone(&version),
            level,
            self.opts.max_file_size,
        );
        compaction.inputs[0] = initial_inputs;

        if level == 0 {
            // Level-0 files overlap; widen to everything touching the
            // chosen file's range.
            let (smallest, largest) = key_range(&self.icmp, &compaction.inputs[0]);
            compaction.inputs[0] =
                version.overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!compaction.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// A manual compaction of every file at `level` overlapping the range.
    pub(crate) fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end:   Option<&InternalKey>,
    ) -> Option<Compaction> {
        let version = self.current();
        let mut inputs = version.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // On levels >= 1, cap the amount of work in one shot to avoid one
        // enormous manual compaction.
        if level > 0 {
            let limit = self.opts.max_file_size * EXPANDED_COMPACTION_FACTOR;
            let mut total = 0;
            let mut keep = inputs.len();
            for (index, file) in inputs.iter().enumerate() {
                total += file.file_size;
                if total >= limit {
                    keep = index + 1;
                    break;
                }
            }
            inputs.truncate(keep);
        }

        let mut compaction =
            Compaction::new(&self.icmp, version, level, self.opts.max_file_size);
        compaction.inputs[0] = inputs;
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Fill in the level+1 inputs, possibly grow the level-`L` side, record
    /// grandparents, and advance the compaction pointer.
    fn setup_other_inputs(&mut self, compaction: &mut Compaction) {
        let version = Arc::clone(&compaction.input_version);
        let level = compaction.level;

        add_boundary_inputs(
            &self.icmp,
            version.files(level),
            &mut compaction.inputs[0],
        );
        let (smallest, mut largest) = key_range(&self.icmp, &compaction.inputs[0]);

        compaction.inputs[1] =
            version.overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        add_boundary_inputs(
            &self.icmp,
            version.files(level + 1),
            &mut compaction.inputs[1],
        );

        let (mut all_start, mut all_limit) =
            key_range_2(&self.icmp, &compaction.inputs[0], &compaction.inputs[1]);

        // Try to grow the level-`L` side without pulling in more level-`L+1`
        // files, as long as total input stays reasonable.
        if !compaction.inputs[1].is_empty() {
            let mut expanded0 =
                version.overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            add_boundary_inputs(&self.icmp, version.files(level), &mut expanded0);

            let inputs1_size = total_file_size(&compaction.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            let expansion_limit = EXPANDED_COMPACTION_FACTOR * self.opts.max_file_size;

            if expanded0.len() > compaction.inputs[0].len()
                && inputs1_size + expanded0_size < expansion_limit
            {
                let (new_start, new_limit) = key_range(&self.icmp, &expanded0);
                let mut expanded1 =
                    version.overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                add_boundary_inputs(&self.icmp, version.files(level + 1), &mut expanded1);

                if expanded1.len() == compaction.inputs[1].len() {
                    info!(
                        level,
                        files_before = compaction.inputs[0].len(),
                        files_after = expanded0.len(),
                        "expanding compaction inputs",
                    );
                    largest = new_limit;
                    compaction.inputs[0] = expanded0;
                    compaction.inputs[1] = expanded1;
                    let recomputed =
                        key_range_2(&self.icmp, &compaction.inputs[0], &compaction.inputs[1]);
                    all_start = recomputed.0;
                    all_limit = recomputed.1;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            compaction.grandparents =
                version.overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Future compactions at this level start past this one's output.
        self.compact_pointer[level] = largest.encoded().to_vec();
        compaction.edit.compact_pointers.push((level, largest));
    }

    // ================================================================
    //  Iteration over compaction inputs
    // ================================================================

    /// A merged iterator over every input file of the compaction, in
    /// internal-key order.
    pub(crate) fn make_input_iterator(&self, compaction: &Compaction) -> Result<MergingIter> {
        let mut children: Vec<BoxedIter> = Vec::new();

        for which in 0..2 {
            let files = &compaction.inputs[which];
            if files.is_empty() {
                continue;
            }
            if which == 0 && compaction.level == 0 {
                // Level-0 files overlap; each gets its own full iterator.
                for file in files {
                    children.push(Box::new(
                        self.table_cache.iter(file.number, file.file_size)?,
                    ));
                }
            } else {
                children.push(Box::new(LevelIter::new(
                    self.icmp.clone(),
                    Arc::clone(&self.table_cache),
                    files.clone(),
                )));
            }
        }

        Ok(MergingIter::new(self.icmp.clone(), children))
    }

    /// Approximate byte offset of `internal_key` within the database.
    pub(crate) fn approximate_offset(&self, version: &Version, internal_key: &InternalKey) -> u64 {
        let mut offset = 0;
        for level in 0..NUM_LEVELS {
            for file in version.files(level) {
                if self.icmp.cmp(file.largest.encoded(), internal_key.encoded())
                    != Ordering::Greater
                {
                    // Entirely before the key.
                    offset += file.file_size;
                } else if self.icmp.cmp(file.smallest.encoded(), internal_key.encoded())
                    == Ordering::Greater
                {
                    // Entirely after; deeper files on sorted levels are too.
                    if level > 0 {
                        break;
                    }
                } else if let Ok(table) = self.table_cache.table(file.number, file.file_size) {
                    offset += table.approximate_offset_of(internal_key.encoded());
                }
            }
        }
        offset
    }
}

/// The smallest and largest internal keys across `files`.
fn key_range(icmp: &InternalKeyComparator, files: &[Arc<FileMetadata>]) -> (InternalKey, InternalKey) {
    debug_assert!(!files.is_empty());
    let mut smallest = files[0].smallest.clone();
    let mut largest = files[0].largest.clone();
    for file in &files[1..] {
        if icmp.cmp_keys(&file.smallest, &smallest) == Ordering::Less {
            smallest = file.smallest.clone();
        }
        if icmp.cmp_keys(&file.largest, &largest) == Ordering::Greater {
            largest = file.largest.clone();
        }
    }
    (smallest, largest)
}

fn key_range_2(
    icmp:   &InternalKeyComparator,
    first:  &[Arc<FileMetadata>],
    second: &[Arc<FileMetadata>],
) -> (InternalKey, InternalKey) {
    let combined: Vec<Arc<FileMetadata>> =
        first.iter().chain(second).map(Arc::clone).collect();
    key_range(icmp, &combined)
}

/// Pull into `inputs` any same-level file whose smallest key continues a
/// user key at one of the current inputs' upper bounds with an older
/// sequence. Without this, entries of one user key could straddle a level
/// boundary out of sequence order.
pub(super) fn add_boundary_inputs(
    icmp:        &InternalKeyComparator,
    level_files: &[Arc<FileMetadata>],
    inputs:      &mut Vec<Arc<FileMetadata>>,
) {
    if inputs.is_empty() {
        return;
    }

    // Each pass adds at least one file, so the level size bounds the loop;
    // the cap only matters if the level's metadata is somehow cyclic.
    for _ in 0..level_files.len() {
        let Some(largest) = inputs
            .iter()
            .map(|file| &file.largest)
            .max_by(|a, b| icmp.cmp_keys(a, b))
            .cloned()
        else {
            return;
        };

        let boundary = level_files
            .iter()
            .filter(|file| {
                // Strictly greater internal key, same user key: an older
                // entry of `largest`'s user key.
                icmp.cmp_keys(&file.smallest, &largest) == Ordering::Greater
                    && icmp
                        .user
                        .cmp(file.smallest.user_key(), largest.user_key())
                        == Ordering::Equal
            })
            .min_by(|a, b| icmp.cmp_keys(&a.smallest, &b.smallest));

        match boundary {
            Some(boundary)
                if !inputs.iter().any(|file| file.number == boundary.number) =>
            {
                inputs.push(Arc::clone(boundary));
            }
            _ => return,
        }
    }
    warn!("boundary-input expansion hit its defensive cap");
}

/// Atomically point `CURRENT` at the given manifest.
pub(crate) fn set_current_file(
    fs:              &dyn FileSystem,
    db_dir:          &std::path::Path,
    manifest_number: u64,
) -> Result<()> {
    let temp_path = DbFile::Temp { number: manifest_number }.path_in(db_dir);
    let contents = format!(
        "{}\n",
        DbFile::Manifest { number: manifest_number }.file_name()
    );

    let mut temp = fs.create(&temp_path)?;
    temp.write_all(contents.as_bytes())?;
    temp.sync_data()?;
    drop(temp);

    let result = fs.rename(&temp_path, &DbFile::Current.path_in(db_dir));
    if result.is_err() {
        let _ = fs.remove_file(&temp_path);
    }
    result.map_err(Into::into)
}

// ================================================================
//  Builder: base version + edit -> new version
// ================================================================

/// Applies edits on top of a base version. Deletions are applied first,
/// then additions, per level.
struct Builder<'a> {
    icmp:    &'a InternalKeyComparator,
    base:    &'a Arc<Version>,
    deleted: [BTreeSet<u64>; NUM_LEVELS],
    added:   [Vec<Arc<FileMetadata>>; NUM_LEVELS],
}

impl<'a> Builder<'a> {
    fn new(icmp: &'a InternalKeyComparator, base: &'a Arc<Version>) -> Self {
        Self {
            icmp,
            base,
            deleted: Default::default(),
            added:   Default::default(),
        }
    }

    fn apply(&mut self, edit: &VersionEdit, compact_pointer: &mut [Vec<u8>; NUM_LEVELS]) {
        for (level, key) in &edit.compact_pointers {
            compact_pointer[*level] = key.encoded().to_vec();
        }
        for (level, number) in &edit.deleted_files {
            self.deleted[*level].insert(*number);
        }
        for (level, params) in &edit.new_files {
            // A file deleted and re-added in the same replay is live (the
            // trivial-move encoding).
            self.deleted[*level].remove(&params.number);
            self.added[*level].push(FileMetadata::from_params(params.clone()));
        }
    }

    fn save_to(self, version: &mut Version) -> Result<()> {
        for level in 0..NUM_LEVELS {
            let mut files: Vec<Arc<FileMetadata>> = self.base.files(level)
                .iter()
                .filter(|file| !self.deleted[level].contains(&file.number))
                .cloned()
                .chain(
                    self.added[level]
                        .iter()
                        .filter(|file| !self.deleted[level].contains(&file.number))
                        .cloned(),
                )
                .collect();

            if level == 0 {
                // Newest first, so reads and merges walk fresh data first.
                files.sort_by(|a, b| b.number.cmp(&a.number));
            } else {
                files.sort_by(|a, b| self.icmp.cmp_keys(&a.smallest, &b.smallest));

                // Levels above 0 must stay disjoint in user-key space.
                for pair in files.windows(2) {
                    if self.icmp.cmp_keys(&pair[0].largest, &pair[1].smallest)
                        != Ordering::Less
                    {
                        return Err(Error::corruption(format!(
                            "overlapping files {} and {} at level {level}",
                            pair[0].number, pair[1].number,
                        )));
                    }
                }
            }

            version.files[level] = files;
        }
        Ok(())
    }
}

// ================================================================
//  Compaction
// ================================================================

/// Everything a level-`L` -> level-`L+1` compaction needs: its inputs, the
/// grandparent overlap bookkeeping that bounds output files, and the edit
/// being accumulated.
pub(crate) struct Compaction {
    pub(crate) level:  usize,
    pub(crate) edit:   VersionEdit,
    pub(crate) inputs: [Vec<Arc<FileMetadata>>; 2],

    icmp:                 InternalKeyComparator,
    pub(crate) input_version: Arc<Version>,
    max_output_file_size: u64,

    grandparents:      Vec<Arc<FileMetadata>>,
    grandparent_index: usize,
    seen_key:          bool,
    overlapped_bytes:  u64,

    /// Per deeper level, how far `is_base_level_for_key` has scanned; keys
    /// arrive in order, so the scan never restarts.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    fn new(
        icmp:          &InternalKeyComparator,
        input_version: Arc<Version>,
        level:         usize,
        max_file_size: u64,
    ) -> Self {
        Self {
            level,
            edit: VersionEdit::new(),
            inputs: [Vec::new(), Vec::new()],
            icmp: icmp.clone(),
            input_version,
            max_output_file_size: max_file_size,
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    #[inline]
    pub(crate) fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    #[inline]
    pub(crate) fn input(&self, which: usize, index: usize) -> &Arc<FileMetadata> {
        &self.inputs[which][index]
    }

    #[inline]
    pub(crate) fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    /// A single input file, nothing to merge with, and bounded grandparent
    /// overlap: the file can simply be re-levelled by an edit.
    pub(crate) fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents)
                <= GRANDPARENT_OVERLAP_FACTOR * self.max_output_file_size
    }

    /// Record every input file as deleted in the compaction's edit.
    pub(crate) fn add_input_deletions(&mut self) {
        for which in 0..2 {
            let level = self.level + which;
            for file in &self.inputs[which] {
                self.edit.deleted_files.push((level, file.number));
            }
        }
    }

    /// Whether no level deeper than the output level contains `user_key`.
    /// When true, a tombstone for the key can be dropped at the output
    /// level.
    pub(crate) fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        for level in self.level + 2..NUM_LEVELS {
            let files = self.input_version.files(level);
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if self.icmp.user.cmp(user_key, file.largest.user_key()) != Ordering::Greater {
                    if self.icmp.user.cmp(user_key, file.smallest.user_key())
                        != Ordering::Less
                    {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Whether the current output file should be closed before writing
    /// `internal_key`, to bound its overlap with the grandparent level.
    pub(crate) fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && self.icmp.cmp(
                internal_key,
                self.grandparents[self.grandparent_index].largest.encoded(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > GRANDPARENT_OVERLAP_FACTOR * self.max_output_file_size {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compaction")
            .field("level", &self.level)
            .field(
                "inputs",
                &[
                    self.inputs[0].iter().map(|f| f.number).collect::<Vec<_>>(),
                    self.inputs[1].iter().map(|f| f.number).collect::<Vec<_>>(),
                ],
            )
            .field("grandparents", &self.grandparents.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::format::{DefaultComparator, ValueType};
    use crate::version::FileMetadataParams;
    use super::*;


    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(DefaultComparator::default()))
    }

    fn file_with_keys(
        number:       u64,
        smallest:     (&[u8], u64),
        largest:      (&[u8], u64),
    ) -> Arc<FileMetadata> {
        FileMetadata::from_params(FileMetadataParams {
            number,
            file_size: 1 << 20,
            smallest: InternalKey::new(smallest.0, smallest.1, ValueType::Value),
            largest:  InternalKey::new(largest.0, largest.1, ValueType::Value),
        })
    }

    #[test]
    fn boundary_expansion_pulls_split_user_keys() {
        let icmp = icmp();

        // One user key "100" split across files: f1 holds sequences 6..5,
        // f2 holds 4..3, f3 is an unrelated key range.
        let f1 = file_with_keys(1, (b"100", 6), (b"100", 5));
        let f2 = file_with_keys(2, (b"100", 4), (b"100", 3));
        let f3 = file_with_keys(3, (b"200", 9), (b"300", 1));
        let level_files = vec![f1.clone(), f2.clone(), f3.clone()];

        let mut inputs = vec![f1];
        add_boundary_inputs(&icmp, &level_files, &mut inputs);

        // The chain closes over f2 but leaves f3 alone.
        assert_eq!(
            inputs.iter().map(|f| f.number).collect::<Vec<_>>(),
            vec![1, 2],
        );
    }

    #[test]
    fn boundary_expansion_follows_chains() {
        let icmp = icmp();

        let f1 = file_with_keys(1, (b"100", 9), (b"100", 8));
        let f2 = file_with_keys(2, (b"100", 7), (b"200", 9));
        let f3 = file_with_keys(3, (b"200", 8), (b"200", 7));
        let level_files = vec![f1.clone(), f2.clone(), f3.clone()];

        let mut inputs = vec![f1];
        add_boundary_inputs(&icmp, &level_files, &mut inputs);

        // f2 continues "100", and then f3 continues f2's "200".
        assert_eq!(
            inputs.iter().map(|f| f.number).collect::<Vec<_>>(),
            vec![1, 2, 3],
        );
    }

    #[test]
    fn boundary_expansion_ignores_unrelated_files() {
        let icmp = icmp();
        let f1 = file_with_keys(1, (b"100", 5), (b"150", 3));
        let f2 = file_with_keys(2, (b"151", 9), (b"200", 1));
        let level_files = vec![f1.clone(), f2];

        let mut inputs = vec![f1];
        add_boundary_inputs(&icmp, &level_files, &mut inputs);
        assert_eq!(inputs.len(), 1);
    }

    #[test]
    fn empty_inputs_stay_empty() {
        let icmp = icmp();
        let files = vec![file_with_keys(1, (b"a", 2), (b"b", 1))];
        let mut inputs = Vec::new();
        add_boundary_inputs(&icmp, &files, &mut inputs);
        assert!(inputs.is_empty());
    }
}
