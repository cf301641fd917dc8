//! The database proper: the public facade, the shared in-process state, the
//! write pipeline, the background compactor, and open/recovery/repair.

mod compaction;
mod open;
mod repair;
mod write;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

use strata_vfs::{FileLock, FileSystem, WritableFile};

use crate::config::NUM_LEVELS;
use crate::error::{Error, Result};
use crate::filenames::DbFile;
use crate::format::{InternalKey, InternalKeyComparator, LookupKey, MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK};
use crate::iterator::{BoxedIter, DbIter, LevelIter, MergingIter};
use crate::log::LogWriter;
use crate::memtable::{MemTable, MemtableLookup};
use crate::options::{Options, ReadOptions, WriteOptions};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::table_cache::TableCache;
use crate::version::{VersionLookup, VersionSet};
use crate::write_batch::WriteBatch;

pub(crate) use self::write::WriterHandle;


/// Per-level compaction statistics backing the `stats` property.
#[derive(Default, Debug, Clone, Copy)]
pub(crate) struct CompactionStats {
    pub micros:        u64,
    pub bytes_read:    u64,
    pub bytes_written: u64,
}

impl CompactionStats {
    pub(crate) fn add(&mut self, other: CompactionStats) {
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}

/// A queued manual compaction, processed by the background worker.
pub(crate) struct ManualCompaction {
    pub level: usize,
    pub begin: Option<InternalKey>,
    pub end:   Option<InternalKey>,
    /// Resume point: after one round, `begin` is advanced here.
    pub done:  bool,
}

/// Everything guarded by the database mutex.
pub(crate) struct DbState {
    pub mem:        MemTable,
    pub imm:        Option<MemTable>,
    pub wal:        Option<LogWriter<Box<dyn WritableFile>>>,
    pub wal_number: u64,

    pub versions: VersionSet,

    /// A background failure; once set, writes fail with it until reopen.
    pub bg_error: Option<Error>,
    pub bg_compaction_scheduled: bool,
    pub manual_compaction: Option<ManualCompaction>,

    /// Files being written (compaction outputs) that must survive
    /// obsolete-file sweeps.
    pub pending_outputs: HashSet<u64>,

    pub writers: VecDeque<Arc<WriterHandle>>,

    pub stats: [CompactionStats; NUM_LEVELS],
}

pub(crate) struct DbInner {
    pub opts:        Options,
    pub fs:          Arc<dyn FileSystem>,
    pub db_dir:      PathBuf,
    pub icmp:        InternalKeyComparator,
    pub table_cache: Arc<TableCache>,

    pub state: Mutex<DbState>,
    /// Signaled when the background worker finishes a unit of work.
    pub background_work_finished: Condvar,
    /// Signaled when a queued writer becomes leader or is completed.
    pub writers_cv: Condvar,

    /// Mirror of `state.imm.is_some()`, readable without the mutex by the
    /// compaction loop.
    pub has_imm: AtomicBool,
    pub shutting_down: AtomicBool,

    pub snapshots: SnapshotList,

    /// Wakes the background worker.
    pub compaction_tx: Sender<()>,

    /// Held for the life of the open database; dropping releases `LOCK`.
    pub file_lock: Mutex<Option<Box<dyn FileLock>>>,
}

impl DbInner {
    /// Queue background work if any is due and none is queued.
    pub(crate) fn maybe_schedule_compaction(&self, state: &mut DbState) {
        if state.bg_compaction_scheduled
            || self.shutting_down.load(AtomicOrdering::Acquire)
            || state.bg_error.is_some()
        {
            return;
        }

        let version = state.versions.current();
        let manual_pending = state
            .manual_compaction
            .as_ref()
            .is_some_and(|manual| !manual.done);
        let work_due = state.imm.is_some()
            || manual_pending
            || version.needs_size_compaction()
            || version.has_seek_compaction();
        if !work_due {
            return;
        }

        state.bg_compaction_scheduled = true;
        let _ = self.compaction_tx.send(());
    }

    /// Latch a background error; all subsequent writes fail with it.
    pub(crate) fn record_background_error(&self, state: &mut DbState, err: Error) {
        if state.bg_error.is_none() {
            error!(error = %err, "background error; writes are stopped");
            state.bg_error = Some(err);
            self.background_work_finished.notify_all();
        }
    }

    /// Delete every file in the directory that no live state references.
    pub(crate) fn delete_obsolete_files(&self, state: &mut DbState) {
        if state.bg_error.is_some() {
            // After a background error the manifest may not reflect
            // reality; keep everything.
            return;
        }

        let mut live = state.versions.live_files();
        live.extend(state.pending_outputs.iter().copied());
        let log_number = state.versions.log_number();
        let prev_log_number = state.versions.prev_log_number();
        let manifest_number = state.versions.manifest_file_number();

        let Ok(children) = self.fs.children(&self.db_dir) else {
            return;
        };

        for child in children {
            let Some(name) = child.to_str() else { continue };
            let Some(parsed) = DbFile::parse(name) else { continue };

            let keep = match parsed {
                DbFile::Log { number } => {
                    number >= log_number || number == prev_log_number
                }
                DbFile::Manifest { number } => number >= manifest_number,
                DbFile::Table { number } | DbFile::LegacyTable { number } => {
                    live.contains(&number)
                }
                DbFile::Temp { number } => state.pending_outputs.contains(&number),
                DbFile::Current | DbFile::Lock | DbFile::InfoLog | DbFile::OldInfoLog => true,
            };

            if !keep {
                if let Some(number) = parsed.number() {
                    if matches!(parsed, DbFile::Table { .. } | DbFile::LegacyTable { .. }) {
                        self.table_cache.evict(number);
                    }
                }
                info!(file = name, "deleting obsolete file");
                let _ = self.fs.remove_file(&self.db_dir.join(child));
            }
        }
    }
}

/// An embedded, ordered, durable key/value store.
///
/// One `Database` owns one directory on one filesystem. All methods are
/// safe to call from any thread; writes are serialized internally with
/// group commit, reads proceed concurrently against immutable state.
/// Dropping the handle closes the database: in-flight background work is
/// drained and the directory lock released.
pub struct Database {
    inner:     Arc<DbInner>,
    compactor: Mutex<Option<JoinHandle<()>>>,
}

impl Database {
    /// Open (and possibly create) the database at `path`. See
    /// [`Options`] for creation and tuning knobs.
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Self> {
        open::open_database(path.as_ref(), opts)
    }

    /// The newest value for `key`, or `None`.
    pub fn get(&self, opts: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;

        let (sequence, mem, imm, version) = {
            let state = inner.state.lock();
            let sequence = match &opts.snapshot {
                Some(snapshot) => snapshot.sequence(),
                None => state.versions.last_sequence(),
            };
            (
                sequence,
                state.mem.clone(),
                state.imm.clone(),
                state.versions.current(),
            )
        };

        let lookup_key = LookupKey::new(key, sequence);

        let outcome = if let Some(found) = mem.get(&lookup_key) {
            found
        } else if let Some(found) = imm.and_then(|imm| imm.get(&lookup_key)) {
            found
        } else {
            let from_tables = version.get(&inner.table_cache, &lookup_key)?;
            // A table read may have armed seek-triggered compaction.
            if version.has_seek_compaction() {
                let mut state = inner.state.lock();
                inner.maybe_schedule_compaction(&mut state);
            }
            match from_tables {
                VersionLookup::Found(value) => MemtableLookup::Value(value),
                VersionLookup::Deleted => MemtableLookup::Deleted,
                VersionLookup::NotFound => return Ok(None),
            }
        };

        Ok(match outcome {
            MemtableLookup::Value(value) => Some(value),
            MemtableLookup::Deleted => None,
        })
    }

    /// Write one key/value pair.
    pub fn put(&self, opts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(opts, batch)
    }

    /// Remove `key` (by writing a tombstone).
    pub fn delete(&self, opts: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(opts, batch)
    }

    /// Apply `batch` atomically: after an `Ok`, either every operation is
    /// visible or (crash without `sync`) none of a trailing suffix is —
    /// never part of a batch.
    pub fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<()> {
        write::write(&self.inner, opts, Some(batch))
    }

    /// An iterator over the whole database as of now (or of
    /// `opts.snapshot`). The view is stable for the iterator's life.
    pub fn iter(&self, opts: &ReadOptions) -> Result<DbIter> {
        let inner = &self.inner;
        let state = inner.state.lock();

        let sequence = match &opts.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => state.versions.last_sequence(),
        };

        let version = state.versions.current();
        let mut children: Vec<BoxedIter> = Vec::new();
        children.push(Box::new(state.mem.iter()));
        if let Some(imm) = &state.imm {
            children.push(Box::new(imm.iter()));
        }
        for file in version.files(0) {
            children.push(Box::new(inner.table_cache.iter(file.number, file.file_size)?));
        }
        for level in 1..NUM_LEVELS {
            if !version.files(level).is_empty() {
                children.push(Box::new(LevelIter::new(
                    inner.icmp.clone(),
                    Arc::clone(&inner.table_cache),
                    version.files(level).to_vec(),
                )));
            }
        }
        drop(state);

        let merged = MergingIter::new(inner.icmp.clone(), children);
        let sample_inner = Arc::clone(inner);
        let trigger = Box::new(move || {
            let mut state = sample_inner.state.lock();
            sample_inner.maybe_schedule_compaction(&mut state);
        });

        Ok(DbIter::new(
            inner.icmp.clone(),
            merged,
            sequence,
            version,
            trigger,
        ))
    }

    /// Capture the current state as a read view. Held snapshots also pin
    /// their entries against compaction.
    #[must_use]
    pub fn get_snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock();
        self.inner.snapshots.acquire(state.versions.last_sequence())
    }

    /// Release a snapshot. Dropping the handle does the same.
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        drop(snapshot);
    }

    /// Database introspection. Known properties: `stratadb.stats`,
    /// `stratadb.sstables`, `stratadb.num-files-at-level<N>`,
    /// `stratadb.approximate-memory-usage`. Unknown names yield `None`.
    #[must_use]
    pub fn get_property(&self, name: &str) -> Option<String> {
        let Some(property) = name.strip_prefix("stratadb.") else {
            return None;
        };
        let state = self.inner.state.lock();

        if let Some(level) = property.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(state.versions.current().num_files(level).to_string());
        }

        match property {
            "stats" => {
                let version = state.versions.current();
                let mut out = String::from(
                    "                               Compactions\n\
                     Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                for level in 0..NUM_LEVELS {
                    let files = version.num_files(level);
                    let stats = &state.stats[level];
                    if files > 0 || stats.micros > 0 {
                        out.push_str(&format!(
                            "{:>3} {:>8} {:>8.0} {:>9.3} {:>8.3} {:>9.3}\n",
                            level,
                            files,
                            state.versions.level_bytes(level) as f64 / 1_048_576.0,
                            stats.micros as f64 / 1e6,
                            stats.bytes_read as f64 / 1_048_576.0,
                            stats.bytes_written as f64 / 1_048_576.0,
                        ));
                    }
                }
                Some(out)
            }
            "sstables" => {
                let version = state.versions.current();
                let mut out = String::new();
                for level in 0..NUM_LEVELS {
                    out.push_str(&format!("--- level {level} ---\n"));
                    for file in version.files(level) {
                        out.push_str(&format!(
                            "{}:{}[{:?} .. {:?}]\n",
                            file.number, file.file_size, file.smallest, file.largest,
                        ));
                    }
                }
                Some(out)
            }
            "approximate-memory-usage" => {
                let mut usage = state.mem.approximate_memory_usage();
                if let Some(imm) = &state.imm {
                    usage += imm.approximate_memory_usage();
                }
                Some(usage.to_string())
            }
            _ => None,
        }
    }

    /// For each `[begin, end)` user-key range, the approximate number of
    /// on-disk bytes the range spans.
    #[must_use]
    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let state = self.inner.state.lock();
        let version = state.versions.current();

        ranges
            .iter()
            .map(|(begin, end)| {
                let begin_key = InternalKey::new(begin, MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK);
                let end_key = InternalKey::new(end, MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK);
                let start = state.versions.approximate_offset(&version, &begin_key);
                let limit = state.versions.approximate_offset(&version, &end_key);
                limit.saturating_sub(start)
            })
            .collect()
    }

    /// Compact every entry overlapping `[begin, end]` down the tree
    /// (`None` bounds are open). Blocks until the work completes. Mostly
    /// useful to reclaim space from deleted data or to optimize a cold
    /// database for reads.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let inner = &self.inner;

        // Highest level with data overlapping the range.
        let mut max_level_with_files = 1;
        {
            let state = inner.state.lock();
            let version = state.versions.current();
            for level in 1..NUM_LEVELS {
                if version.overlap_in_level(level, begin, end) {
                    max_level_with_files = level;
                }
            }
        }

        // The memtable may hold range data too: force it out first.
        write::write(inner, &WriteOptions::default(), None)?;
        {
            let mut state = inner.state.lock();
            while state.imm.is_some() && state.bg_error.is_none() {
                inner.background_work_finished.wait(&mut state);
            }
            if let Some(err) = &state.bg_error {
                return Err(err.clone());
            }
        }

        for level in 0..max_level_with_files {
            compaction::compact_range_level(inner, level, begin, end)?;
        }
        Ok(())
    }

    /// Block until no compaction work remains. Test and benchmark plumbing.
    pub fn compact_until_quiet(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        loop {
            inner.maybe_schedule_compaction(&mut state);
            if !state.bg_compaction_scheduled && state.imm.is_none() {
                break;
            }
            if let Some(err) = &state.bg_error {
                return Err(err.clone());
            }
            inner.background_work_finished.wait(&mut state);
        }
        Ok(())
    }

    /// Destroy the database at `path`: every file it owns is deleted.
    /// Nothing else in the directory is touched. Must not be called on an
    /// open database.
    pub fn destroy(path: impl AsRef<Path>, opts: &Options) -> Result<()> {
        open::destroy_database(path.as_ref(), opts)
    }

    /// Best-effort repair of a database whose manifest is lost or corrupt:
    /// logs are replayed into tables, tables are scanned for their key
    /// ranges, and a fresh manifest is written registering all of them at
    /// level 0. Unusable files are archived under `lost/`.
    pub fn repair(path: impl AsRef<Path>, opts: &Options) -> Result<()> {
        repair::repair_database(path.as_ref(), opts)
    }

    pub(crate) fn from_parts(inner: Arc<DbInner>, compactor: JoinHandle<()>) -> Self {
        Self { inner, compactor: Mutex::new(Some(compactor)) }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.shutting_down.store(true, AtomicOrdering::Release);

        // Wait out any in-flight background work; the worker clears the
        // flag and signals even when it bails early for shutdown.
        {
            let mut state = inner.state.lock();
            while state.bg_compaction_scheduled {
                inner.background_work_finished.wait(&mut state);
            }
        }

        let _ = inner.compaction_tx.send(());
        if let Some(handle) = self.compactor.lock().take() {
            let _ = handle.join();
        }

        // Release the advisory lock last.
        *inner.file_lock.lock() = None;
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.db_dir)
            .finish_non_exhaustive()
    }
}
