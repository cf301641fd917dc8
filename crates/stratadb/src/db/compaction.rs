//! The background compaction worker: memtable flushes, level merges, and
//! the shared table-building path used by flushes, recovery, and repair.

use std::sync::Arc;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::Instant;

use parking_lot::MutexGuard;
use tracing::{debug, info};

use strata_sstable::{SeekableIterator, TableBuilder, TableComparator as _, WriteTableOptions};

use crate::error::{Error, Result};
use crate::filenames::DbFile;
use crate::format::{
    InternalFilterPolicy, InternalKey, ParsedInternalKey, SequenceNumber, ValueType,
    MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK,
};
use crate::version::{Compaction, FileMetadataParams, VersionEdit};

use super::{CompactionStats, DbInner, DbState, ManualCompaction};


/// Table-writing options shared by every path that produces a table file.
pub(crate) fn write_table_options(
    opts: &crate::options::Options,
    icmp: &crate::format::InternalKeyComparator,
) -> WriteTableOptions {
    WriteTableOptions {
        comparator:       Arc::new(icmp.clone()),
        filter_policy:    opts
            .filter_policy
            .clone()
            .map(|policy| Arc::new(InternalFilterPolicy::new(policy)) as _),
        block_size:       opts.block_size,
        restart_interval: opts.block_restart_interval,
        compression:      opts.compression,
    }
}

/// Drain `iter` into table file `file_number`. Returns metadata with
/// `file_size == 0` (and writes nothing) when the iterator is empty.
///
/// The freshly written table is opened back through the table cache, so a
/// file that cannot be read never makes it into a version. Standalone so
/// that recovery and repair (which run before a `DbInner` exists) share it
/// with the runtime flush path.
pub(crate) fn build_table(
    fs:          &dyn strata_vfs::FileSystem,
    db_dir:      &std::path::Path,
    opts:        &crate::options::Options,
    icmp:        &crate::format::InternalKeyComparator,
    table_cache: &crate::table_cache::TableCache,
    file_number: u64,
    iter:        &mut dyn SeekableIterator,
) -> Result<FileMetadataParams> {
    iter.seek_to_first();

    let path = DbFile::Table { number: file_number }.path_in(db_dir);
    if !iter.valid() {
        iter.status()?;
        return Ok(FileMetadataParams {
            number:    file_number,
            file_size: 0,
            smallest:  InternalKey::default(),
            largest:   InternalKey::default(),
        });
    }

    let result = (|| {
        let file = fs.create(&path)?;
        let mut builder = TableBuilder::new(file, write_table_options(opts, icmp));

        let smallest = InternalKey::decode_from(iter.key())?;
        let mut largest = InternalKey::default();
        while iter.valid() {
            largest = InternalKey::decode_from(iter.key())?;
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }
        iter.status()?;

        let file_size = builder.finish(true)?;

        // Paranoia that pays for itself: make sure what we wrote opens.
        table_cache.table(file_number, file_size)?;

        Ok(FileMetadataParams {
            number: file_number,
            file_size,
            smallest,
            largest,
        })
    })();

    if result.is_err() {
        let _ = fs.remove_file(&path);
    }
    result
}

/// Flush `mem` to a table, placed as deep as the version allows, and record
/// it (plus compaction stats) in `edit`. The caller owns pending-output
/// registration of `file_number`.
fn write_level0_table(
    inner:       &DbInner,
    state:       &mut MutexGuard<'_, DbState>,
    file_number: u64,
    mem:         &crate::memtable::MemTable,
    edit:        &mut VersionEdit,
) -> Result<()> {
    let start = Instant::now();
    let base_version = state.versions.current();

    let mut iter = mem.iter();
    let built = MutexGuard::unlocked(state, || {
        build_table(
            &*inner.fs,
            &inner.db_dir,
            &inner.opts,
            &inner.icmp,
            &inner.table_cache,
            file_number,
            &mut iter,
        )
    });
    let params = built?;

    if params.file_size == 0 {
        state.versions.reuse_file_number(file_number);
        return Ok(());
    }

    let level = base_version.pick_level_for_memtable_output(
        params.smallest.user_key(),
        params.largest.user_key(),
        inner.opts.max_file_size,
    );
    info!(
        file = params.number,
        size = params.file_size,
        level,
        "flushed memtable to table",
    );

    state.stats[level].add(CompactionStats {
        micros:        start.elapsed().as_micros() as u64,
        bytes_read:    0,
        bytes_written: params.file_size,
    });
    edit.add_file(level, params.number, params.file_size, params.smallest, params.largest);
    Ok(())
}

/// Flush the immutable memtable, if one is waiting.
pub(super) fn compact_memtable(inner: &Arc<DbInner>, state: &mut MutexGuard<'_, DbState>) {
    let Some(imm) = state.imm.clone() else {
        return;
    };

    let file_number = state.versions.new_file_number();
    state.pending_outputs.insert(file_number);

    let mut edit = VersionEdit::new();
    let result = write_level0_table(inner, state, file_number, &imm, &mut edit)
        .and_then(|()| {
            if inner.shutting_down.load(AtomicOrdering::Acquire) {
                return Err(Error::io("shutting down during memtable flush"));
            }
            // The flushed WAL (and any predecessor) is no longer needed.
            edit.prev_log_number = Some(0);
            edit.log_number = Some(state.wal_number);
            state.versions.log_and_apply(edit)
        });

    state.pending_outputs.remove(&file_number);

    match result {
        Ok(()) => {
            state.imm = None;
            inner.has_imm.store(false, AtomicOrdering::Release);
            debug!(levels = %state.versions.current().level_summary(), "flush installed");
            inner.delete_obsolete_files(state);
        }
        Err(err) => {
            inner.record_background_error(state, err);
        }
    }
}

/// One full pass of the background worker.
pub(crate) fn background_call(inner: &Arc<DbInner>) {
    let mut state = inner.state.lock();
    debug_assert!(state.bg_compaction_scheduled);

    if !inner.shutting_down.load(AtomicOrdering::Acquire) && state.bg_error.is_none() {
        background_compaction(inner, &mut state);
    }

    state.bg_compaction_scheduled = false;
    // The just-finished unit may have unlocked the next one.
    inner.maybe_schedule_compaction(&mut state);
    inner.background_work_finished.notify_all();
}

fn background_compaction(inner: &Arc<DbInner>, state: &mut MutexGuard<'_, DbState>) {
    if state.imm.is_some() {
        compact_memtable(inner, state);
        return;
    }

    // Manual compactions take priority over the pickers.
    let manual_request = state
        .manual_compaction
        .as_ref()
        .filter(|manual| !manual.done)
        .map(|manual| (manual.level, manual.begin.clone(), manual.end.clone()));

    let (compaction, is_manual) = match manual_request {
        Some((level, begin, end)) => {
            let compaction = state.versions.compact_range(level, begin.as_ref(), end.as_ref());
            if compaction.is_none() {
                if let Some(manual) = &mut state.manual_compaction {
                    manual.done = true;
                }
            }
            (compaction, true)
        }
        None => (state.versions.pick_compaction(), false),
    };

    let Some(mut compaction) = compaction else {
        return;
    };

    if !is_manual && compaction.is_trivial_move() {
        // Move the file down a level with a metadata-only edit.
        let file = Arc::clone(compaction.input(0, 0));
        let level = compaction.level;
        compaction.edit.remove_file(level, file.number);
        compaction.edit.add_file(
            level + 1,
            file.number,
            file.file_size,
            file.smallest.clone(),
            file.largest.clone(),
        );
        info!(file = file.number, from = level, to = level + 1, "trivial move");

        let edit = std::mem::replace(&mut compaction.edit, VersionEdit::new());
        if let Err(err) = state.versions.log_and_apply(edit) {
            inner.record_background_error(state, err);
        }
        inner.delete_obsolete_files(state);
        return;
    }

    // Remember where the manual round got to before the work consumes the
    // compaction.
    let manual_resume_key = compaction
        .inputs[0]
        .iter()
        .map(|file| &file.largest)
        .max_by(|a, b| inner.icmp.cmp(a.encoded(), b.encoded()))
        .cloned();

    let result = do_compaction_work(inner, state, compaction);
    if let Err(err) = result {
        inner.record_background_error(state, err);
    }
    inner.delete_obsolete_files(state);

    if is_manual {
        let has_bg_error = state.bg_error.is_some();
        if let Some(manual) = &mut state.manual_compaction {
            if has_bg_error {
                manual.done = true;
            } else if !manual.done {
                // Resume after the keys this round consumed.
                manual.begin = manual_resume_key;
            }
        }
    }
}

/// A finished compaction output file.
struct CompactionOutput {
    number:    u64,
    file_size: u64,
    smallest:  InternalKey,
    largest:   InternalKey,
}

/// The output file being written, plus everything finished so far.
struct OutputSink<'db> {
    inner:    &'db DbInner,
    builder:  Option<TableBuilder<Box<dyn strata_vfs::WritableFile>>>,
    current:  Option<(u64, InternalKey)>,
    last_key: Vec<u8>,
    outputs:  Vec<CompactionOutput>,
    /// Every file number this sink registered in `pending_outputs`,
    /// including an abandoned in-progress file; the caller deregisters them
    /// all so nothing stays pinned after a failure.
    allocated: Vec<u64>,
}

impl<'db> OutputSink<'db> {
    fn new(inner: &'db DbInner) -> Self {
        Self {
            inner,
            builder: None,
            current: None,
            last_key: Vec::new(),
            outputs: Vec::new(),
            allocated: Vec::new(),
        }
    }

    /// Lazily open an output file. Called with the database mutex *not*
    /// held; takes it briefly for the file number.
    fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.builder.is_none() {
            let number = {
                let mut state = self.inner.state.lock();
                let number = state.versions.new_file_number();
                state.pending_outputs.insert(number);
                number
            };
            self.allocated.push(number);
            let path = DbFile::Table { number }.path_in(&self.inner.db_dir);
            let file = self.inner.fs.create(&path)?;
            self.builder = Some(TableBuilder::new(
                file,
                write_table_options(&self.inner.opts, &self.inner.icmp),
            ));
            self.current = Some((number, InternalKey::decode_from(key)?));
        }

        let builder = self.builder.as_mut().expect("just opened");
        builder.add(key, value)?;
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        Ok(())
    }

    fn current_size(&self) -> u64 {
        self.builder.as_ref().map_or(0, TableBuilder::file_offset)
    }

    fn has_open_file(&self) -> bool {
        self.builder.is_some()
    }

    /// Finish the open output file, verifying it is readable.
    fn finish_current(&mut self) -> Result<()> {
        let Some(builder) = self.builder.take() else {
            return Ok(());
        };
        let (number, smallest) = self.current.take().expect("open file has metadata");

        let num_entries = builder.num_entries();
        let file_size = builder.finish(true)?;
        self.inner.table_cache.table(number, file_size)?;

        debug!(file = number, entries = num_entries, size = file_size, "compaction output");
        self.outputs.push(CompactionOutput {
            number,
            file_size,
            smallest,
            largest: InternalKey::decode_from(&self.last_key)?,
        });
        Ok(())
    }

    fn abandon(&mut self) {
        if let Some(builder) = self.builder.take() {
            builder.abandon();
        }
        self.current = None;
    }
}

/// Merge the compaction's inputs into new files at `level + 1`, dropping
/// entries that no snapshot can see, then commit the swap.
fn do_compaction_work(
    inner:      &Arc<DbInner>,
    state:      &mut MutexGuard<'_, DbState>,
    mut compaction: Compaction,
) -> Result<()> {
    let start = Instant::now();
    info!(
        level = compaction.level,
        inputs = compaction.num_input_files(0),
        overlaps = compaction.num_input_files(1),
        "compacting",
    );

    // Entries at or below this sequence that are shadowed by newer entries
    // may be dropped for good.
    let smallest_snapshot = inner
        .snapshots
        .smallest()
        .unwrap_or_else(|| state.versions.last_sequence());

    let mut input = state.versions.make_input_iterator(&compaction)?;

    let mut sink = OutputSink::new(inner);
    let merge_result = MutexGuard::unlocked(state, || {
        merge_inputs(inner, &mut compaction, &mut input, &mut sink, smallest_snapshot)
    });

    let stats_update = CompactionStats {
        micros: start.elapsed().as_micros() as u64,
        bytes_read: (0..2)
            .map(|which| {
                (0..compaction.num_input_files(which))
                    .map(|i| compaction.input(which, i).file_size)
                    .sum::<u64>()
            })
            .sum(),
        bytes_written: sink.outputs.iter().map(|output| output.file_size).sum(),
    };
    let output_level = compaction.level + 1;
    state.stats[output_level].add(stats_update);

    let outputs: Vec<CompactionOutput> = std::mem::take(&mut sink.outputs);
    let pending: Vec<u64> = std::mem::take(&mut sink.allocated);

    let commit = merge_result.and_then(|()| {
        compaction.add_input_deletions();
        for output in outputs {
            compaction.edit.add_file(
                output_level,
                output.number,
                output.file_size,
                output.smallest,
                output.largest,
            );
        }
        state.versions.log_and_apply(std::mem::replace(
            &mut compaction.edit,
            VersionEdit::new(),
        ))
    });

    for number in pending {
        state.pending_outputs.remove(&number);
    }
    if commit.is_ok() {
        info!(levels = %state.versions.current().level_summary(), "compaction installed");
    }
    commit
}

/// The unlocked heart of a compaction: iterate the merged inputs, decide
/// entry by entry what survives, and stream survivors into output files.
fn merge_inputs(
    inner:      &Arc<DbInner>,
    compaction: &mut Compaction,
    input:      &mut dyn SeekableIterator,
    sink:       &mut OutputSink<'_>,
    smallest_snapshot: SequenceNumber,
) -> Result<()> {
    input.seek_to_first();

    let mut current_user_key: Option<Vec<u8>> = None;
    let mut last_sequence_for_key = MAX_SEQUENCE + 1;

    let result = (|| {
        while input.valid() {
            if inner.shutting_down.load(AtomicOrdering::Acquire) {
                return Err(Error::io("shutting down during compaction"));
            }

            // A full memtable outranks this compaction; flush it first so
            // writers do not stall behind us.
            if inner.has_imm.load(AtomicOrdering::Acquire) {
                let mut state = inner.state.lock();
                compact_memtable(inner, &mut state);
                drop(state);
                inner.background_work_finished.notify_all();
            }

            if sink.has_open_file() && compaction.should_stop_before(input.key()) {
                sink.finish_current()?;
            }

            let mut drop_entry = false;
            match ParsedInternalKey::decode(input.key()) {
                Err(_) => {
                    // Keep undecodable entries; hiding them would mask
                    // corruption.
                    current_user_key = None;
                    last_sequence_for_key = MAX_SEQUENCE + 1;
                }
                Ok(parsed) => {
                    let first_occurrence = current_user_key
                        .as_deref()
                        .map_or(true, |current| {
                            inner.icmp.user.cmp(parsed.user_key, current)
                                != std::cmp::Ordering::Equal
                        });
                    if first_occurrence {
                        current_user_key = Some(parsed.user_key.to_vec());
                        last_sequence_for_key = MAX_SEQUENCE + 1;
                    }

                    if last_sequence_for_key <= smallest_snapshot {
                        // A newer entry for this user key was already kept,
                        // and no live snapshot can see this one.
                        drop_entry = true;
                    } else if parsed.value_type == ValueType::Deletion
                        && parsed.sequence <= smallest_snapshot
                        && compaction.is_base_level_for_key(parsed.user_key)
                    {
                        // The tombstone has done its work: nothing older
                        // survives below, and no snapshot needs it.
                        drop_entry = true;
                    }
                    last_sequence_for_key = parsed.sequence;
                }
            }

            if !drop_entry {
                sink.add(input.key(), input.value())?;
                if sink.current_size() >= compaction.max_output_file_size() {
                    sink.finish_current()?;
                }
            }

            input.next();
        }

        input.status()?;
        sink.finish_current()
    })();

    if result.is_err() {
        sink.abandon();
    }
    result
}

/// Foreground half of a manual range compaction at one level: queue the
/// request and wait for the worker to chew through it.
pub(super) fn compact_range_level(
    inner: &Arc<DbInner>,
    level: usize,
    begin: Option<&[u8]>,
    end:   Option<&[u8]>,
) -> Result<()> {
    {
        let mut state = inner.state.lock();
        while state.manual_compaction.is_some() {
            // One manual compaction at a time.
            inner.background_work_finished.wait(&mut state);
        }
        state.manual_compaction = Some(ManualCompaction {
            level,
            begin: begin.map(|key| InternalKey::new(key, MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK)),
            end:   end.map(|key| InternalKey::new(key, 0, ValueType::Deletion)),
            done:  false,
        });
        inner.maybe_schedule_compaction(&mut state);

        while state
            .manual_compaction
            .as_ref()
            .is_some_and(|manual| !manual.done)
        {
            if let Some(err) = &state.bg_error {
                let err = err.clone();
                state.manual_compaction = None;
                return Err(err);
            }
            inner.maybe_schedule_compaction(&mut state);
            inner.background_work_finished.wait(&mut state);
        }
        state.manual_compaction = None;
        inner.background_work_finished.notify_all();
    }
    Ok(())
}
