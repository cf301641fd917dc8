//! Opening a database: locking, manifest recovery, WAL replay, and the
//! initial background kick. Also `destroy`.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crossbeam_channel::unbounded;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::config::NUM_LEVELS;
use crate::error::{Error, Result};
use crate::filenames::DbFile;
use crate::format::{InternalKeyComparator, SequenceNumber};
use crate::log::{LogReader, LogReporter, LogWriter};
use crate::memtable::MemTable;
use crate::options::Options;
use crate::snapshot::SnapshotList;
use crate::table_cache::TableCache;
use crate::version::{VersionEdit, VersionSet};
use crate::write_batch::WriteBatch;

use super::compaction::{background_call, build_table};
use super::{Database, DbInner, DbState};


/// Table-cache slots are `max_open_files` minus this reserve for the WAL,
/// manifest, lockfile, and breathing room.
const OPEN_FILES_RESERVE: usize = 10;

pub(super) fn open_database(path: &Path, mut opts: Options) -> Result<Database> {
    // Give a cache-less database its own private block cache.
    if opts.block_cache.is_none() {
        opts.block_cache = Some(Arc::new(strata_sstable::BlockCache::new(8 << 20)));
    }

    let fs = Arc::clone(&opts.fs);
    let db_dir = path.to_path_buf();
    let icmp = InternalKeyComparator::new(Arc::clone(&opts.comparator));

    fs.create_dir_all(&db_dir)?;
    let file_lock = fs.lock(&DbFile::Lock.path_in(&db_dir))?;

    let current_exists = fs.exists(&DbFile::Current.path_in(&db_dir))?;
    if !current_exists {
        if !opts.create_if_missing {
            return Err(Error::invalid_argument(format!(
                "{}: does not exist (create_if_missing is false)",
                db_dir.display(),
            )));
        }
        initialize_db_dir(&*fs, &db_dir, &opts)?;
        info!(path = %db_dir.display(), "created new database");
    } else if opts.error_if_exists {
        return Err(Error::invalid_argument(format!(
            "{}: exists (error_if_exists is true)",
            db_dir.display(),
        )));
    }

    let table_cache = Arc::new(TableCache::new(
        Arc::clone(&fs),
        db_dir.clone(),
        icmp.clone(),
        opts.clone(),
        opts.max_open_files.saturating_sub(OPEN_FILES_RESERVE),
    ));

    let mut versions = VersionSet::new(
        Arc::clone(&fs),
        db_dir.clone(),
        opts.clone(),
        icmp.clone(),
        Arc::clone(&table_cache),
    );
    let mut save_manifest = versions.recover()?;

    // Replay WALs younger than the manifest's log marker (and the marker of
    // a half-flushed predecessor, if recorded).
    let mut edit = VersionEdit::new();
    let mut max_sequence: SequenceNumber = 0;
    let replay = replay_write_ahead_logs(
        &opts,
        &*fs,
        &db_dir,
        &icmp,
        &mut versions,
        &mut edit,
        &mut max_sequence,
    )?;
    save_manifest |= replay.wrote_tables;

    if versions.last_sequence() < max_sequence {
        versions.set_last_sequence(max_sequence);
    }

    // Set up the live WAL and memtable: reuse the tail log when recovery
    // says we can, otherwise start a fresh one.
    let (mem, wal, wal_number) = match replay.reusable_tail {
        Some((mem, wal, number)) => (mem, wal, number),
        None => {
            let number = versions.new_file_number();
            let file = fs.create(&DbFile::Log { number }.path_in(&db_dir))?;
            edit.log_number = Some(number);
            save_manifest = true;
            (MemTable::new(icmp.clone()), LogWriter::new(file), number)
        }
    };

    if save_manifest {
        edit.prev_log_number = Some(0);
        if edit.log_number.is_none() {
            edit.log_number = Some(wal_number);
        }
        versions.log_and_apply(edit)?;
    }

    let (compaction_tx, compaction_rx) = unbounded();
    let inner = Arc::new(DbInner {
        opts,
        fs,
        db_dir,
        icmp,
        table_cache,
        state: Mutex::new(DbState {
            mem,
            imm: None,
            wal: Some(wal),
            wal_number,
            versions,
            bg_error: None,
            bg_compaction_scheduled: false,
            manual_compaction: None,
            pending_outputs: Default::default(),
            writers: VecDeque::new(),
            stats: [Default::default(); NUM_LEVELS],
        }),
        background_work_finished: Condvar::new(),
        writers_cv: Condvar::new(),
        has_imm: AtomicBool::new(false),
        shutting_down: AtomicBool::new(false),
        snapshots: SnapshotList::new(),
        compaction_tx,
        file_lock: Mutex::new(Some(file_lock)),
    });

    {
        let mut state = inner.state.lock();
        inner.delete_obsolete_files(&mut state);
        inner.maybe_schedule_compaction(&mut state);
    }

    let worker_inner = Arc::downgrade(&inner);
    let compactor = std::thread::Builder::new()
        .name("stratadb-compact".to_owned())
        .spawn(move || {
            while compaction_rx.recv().is_ok() {
                let Some(inner) = worker_inner.upgrade() else {
                    break;
                };
                if inner.shutting_down.load(std::sync::atomic::Ordering::Acquire) {
                    break;
                }
                background_call(&inner);
            }
        })
        .expect("failed to spawn compaction thread");

    Ok(Database::from_parts(inner, compactor))
}

/// Write the very first manifest and `CURRENT` of a new database.
fn initialize_db_dir(
    fs:     &dyn strata_vfs::FileSystem,
    db_dir: &Path,
    opts:   &Options,
) -> Result<()> {
    let mut edit = VersionEdit::new();
    edit.comparator_name = Some(opts.comparator.name().to_owned());
    edit.log_number = Some(0);
    edit.next_file_number = Some(2);
    edit.last_sequence = Some(0);

    let manifest_number = 1;
    let manifest_path = DbFile::Manifest { number: manifest_number }.path_in(db_dir);
    let file = fs.create(&manifest_path)?;
    let mut writer = LogWriter::new(file);

    let mut record = Vec::new();
    edit.encode(&mut record);
    let written = writer.add_record(&record).and_then(|()| writer.sync());
    if let Err(err) = written {
        let _ = fs.remove_file(&manifest_path);
        return Err(err.into());
    }

    crate::version::set_current_file(fs, db_dir, manifest_number)
}

struct WalReplayOutcome {
    /// Whether any level-0 table was produced (the manifest must record
    /// them).
    wrote_tables: bool,
    /// The tail WAL kept as the live log (reuse-logs), with the memtable
    /// still holding its entries.
    reusable_tail: Option<(MemTable, LogWriter<Box<dyn strata_vfs::WritableFile>>, u64)>,
}

struct ReplayReporter<'a> {
    opts:   &'a Options,
    status: Option<Error>,
}

impl LogReporter for &mut ReplayReporter<'_> {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        warn!(bytes, reason, "write-ahead log damaged");
        if self.opts.paranoid_checks && self.status.is_none() {
            self.status = Some(Error::corruption(format!(
                "log record dropped: {reason} ({bytes} bytes)"
            )));
        }
    }
}

fn replay_write_ahead_logs(
    opts:         &Options,
    fs:           &dyn strata_vfs::FileSystem,
    db_dir:       &Path,
    icmp:         &InternalKeyComparator,
    versions:     &mut VersionSet,
    edit:         &mut VersionEdit,
    max_sequence: &mut SequenceNumber,
) -> Result<WalReplayOutcome> {
    let min_log = versions.log_number();
    let prev_log = versions.prev_log_number();

    let mut log_numbers: Vec<u64> = fs
        .children(db_dir)?
        .into_iter()
        .filter_map(|child| DbFile::parse(child.to_str()?))
        .filter_map(|file| match file {
            DbFile::Log { number } if number >= min_log || number == prev_log => Some(number),
            _ => None,
        })
        .collect();
    log_numbers.sort_unstable();

    let mut outcome = WalReplayOutcome { wrote_tables: false, reusable_tail: None };
    let mut mem: Option<MemTable> = None;

    // The version set must not reuse any replayed log's number.
    for &number in &log_numbers {
        versions.mark_file_number_used(number);
    }

    let num_logs = log_numbers.len();
    for (log_index, &number) in log_numbers.iter().enumerate() {
        let path = DbFile::Log { number }.path_in(db_dir);
        let file = fs.open_sequential(&path)?;

        let mut reporter = ReplayReporter { opts, status: None };
        let mut reader = LogReader::new(file, &mut reporter);
        info!(log = number, "replaying write-ahead log");

        let mut compactions = 0_usize;
        while let Some(record) = reader.read_record() {
            let batch = match WriteBatch::from_contents(record) {
                Ok(batch) => batch,
                Err(err) => {
                    if opts.paranoid_checks {
                        return Err(err);
                    }
                    warn!(error = %err, "dropping short log record");
                    continue;
                }
            };

            let memtable = mem.get_or_insert_with(|| MemTable::new(icmp.clone()));
            batch.insert_into(memtable, batch.sequence())?;

            let last_in_batch = batch.sequence() + u64::from(batch.count()).saturating_sub(1);
            if last_in_batch > *max_sequence {
                *max_sequence = last_in_batch;
            }

            if memtable.approximate_memory_usage() > opts.write_buffer_size {
                compactions += 1;
                outcome.wrote_tables = true;
                flush_recovered_memtable(versions, edit, memtable, db_dir, fs, opts, icmp)?;
                mem = None;
            }
        }
        drop(reader);

        if let Some(err) = reporter.status {
            return Err(err);
        }

        // Keep appending to the final log if nothing forced it out and the
        // caller asked for log reuse; its entries then stay in the live
        // memtable, backed by the log itself.
        let is_last = log_index + 1 == num_logs;
        if is_last && opts.reuse_logs && compactions == 0 {
            let size = fs.size_of(&path)?;
            if size < opts.max_file_size {
                info!(log = number, size, "reusing tail write-ahead log");
                let append = fs.append(&path)?;
                outcome.reusable_tail = Some((
                    mem.take().unwrap_or_else(|| MemTable::new(icmp.clone())),
                    LogWriter::new_at_offset(append, size),
                    number,
                ));
                return Ok(outcome);
            }
        }

        // One flush per log, so each log becomes obsolete the moment the
        // manifest commits.
        if let Some(memtable) = mem.take() {
            if !memtable.is_empty() {
                outcome.wrote_tables = true;
                flush_recovered_memtable(versions, edit, &memtable, db_dir, fs, opts, icmp)?;
            }
        }
    }

    Ok(outcome)
}

fn flush_recovered_memtable(
    versions: &mut VersionSet,
    edit:     &mut VersionEdit,
    memtable: &MemTable,
    db_dir:   &Path,
    fs:       &dyn strata_vfs::FileSystem,
    opts:     &Options,
    icmp:     &InternalKeyComparator,
) -> Result<()> {
    let number = versions.new_file_number();
    let mut iter = memtable.iter();
    let params = build_table(fs, db_dir, opts, icmp, &versions.table_cache, number, &mut iter)?;
    if params.file_size > 0 {
        // Recovery flushes always land at level 0; there is no settled
        // version to push them deeper against yet.
        edit.add_file(0, params.number, params.file_size, params.smallest, params.largest);
    } else {
        versions.reuse_file_number(number);
    }
    Ok(())
}

pub(super) fn destroy_database(path: &Path, opts: &Options) -> Result<()> {
    let fs = &opts.fs;
    let Ok(children) = fs.children(path) else {
        // Missing directory counts as destroyed.
        return Ok(());
    };

    let lock_path = DbFile::Lock.path_in(path);
    let lock = fs.lock(&lock_path)?;

    let mut result = Ok(());
    for child in children {
        let Some(name) = child.to_str() else { continue };
        let Some(parsed) = DbFile::parse(name) else {
            // Not ours; leave it alone.
            continue;
        };
        if matches!(parsed, DbFile::Lock) {
            continue;
        }
        if let Err(err) = fs.remove_file(&path.join(child)) {
            result = Err(err.into());
        }
    }

    drop(lock);
    let _ = fs.remove_file(&lock_path);
    let _ = fs.remove_dir(path);
    result
}
