//! The write pipeline: a queue of writers whose head becomes the leader,
//! merges the batches behind it into one WAL append and one memtable
//! apply, and wakes everyone with the shared outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use parking_lot::{Mutex, MutexGuard};

use crate::config::{
    L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER, MAX_MERGED_WRITE_BYTES,
    SMALL_MERGED_WRITE_BYTES, SMALL_WRITE_BYTES,
};
use crate::error::{Error, Result};
use crate::filenames::DbFile;
use crate::log::LogWriter;
use crate::memtable::MemTable;
use crate::options::WriteOptions;
use crate::write_batch::WriteBatch;

use super::{DbInner, DbState};


/// One queued write. `batch: None` is a rotation request: it forces the
/// memtable to be handed to compaction without writing anything (used by
/// manual compaction).
pub(crate) struct WriterHandle {
    batch:  Option<WriteBatch>,
    sync:   bool,
    done:   AtomicBool,
    result: Mutex<Option<Result<()>>>,
}

impl WriterHandle {
    fn new(batch: Option<WriteBatch>, sync: bool) -> Arc<Self> {
        Arc::new(Self {
            batch,
            sync,
            done: AtomicBool::new(false),
            result: Mutex::new(None),
        })
    }

    fn complete(&self, result: Result<()>) {
        *self.result.lock() = Some(result);
        self.done.store(true, AtomicOrdering::Release);
    }

    fn take_result(&self) -> Result<()> {
        self.result.lock().take().unwrap_or(Ok(()))
    }
}

pub(crate) fn write(
    inner: &Arc<DbInner>,
    opts:  &WriteOptions,
    batch: Option<WriteBatch>,
) -> Result<()> {
    let me = WriterHandle::new(batch, opts.sync);

    let mut state = inner.state.lock();
    state.writers.push_back(Arc::clone(&me));

    // Wait until a leader finished this write for us, or we are the head.
    while !me.done.load(AtomicOrdering::Acquire)
        && !state
            .writers
            .front()
            .is_some_and(|front| Arc::ptr_eq(front, &me))
    {
        inner.writers_cv.wait(&mut state);
    }
    if me.done.load(AtomicOrdering::Acquire) {
        return me.take_result();
    }

    // We are the leader.
    let force_rotation = me.batch.is_none();
    let (returned_state, room) = make_room_for_write(inner, state, force_rotation);
    state = returned_state;
    let mut group_result = room;
    let mut group: Vec<Arc<WriterHandle>> = vec![Arc::clone(&me)];

    if group_result.is_ok() && me.batch.is_some() {
        let merged = build_write_group(&state, &me, &mut group);
        let sequence = state.versions.last_sequence() + 1;
        let count = u64::from(merged.count());
        let sync = group.iter().any(|writer| writer.sync);

        // Heavy lifting happens without the mutex: WAL append, optional
        // fsync, memtable apply. The queue discipline keeps other writers
        // out of the log and memtable meanwhile.
        let mut wal = state.wal.take().expect("wal present while writing");
        let mem = state.mem.clone();
        drop(state);

        let mut merged = merged;
        merged.set_sequence(sequence);
        let io_result = append_group(&mut wal, &mem, &merged, sync);

        state = inner.state.lock();
        state.wal = Some(wal);

        match io_result {
            Ok(()) => {
                state.versions.set_last_sequence(sequence + count - 1);
                group_result = Ok(());
            }
            Err(err) => {
                // A partial WAL record may now be on disk. Subsequent
                // writes must not append after it; latch the error.
                inner.record_background_error(&mut state, err.clone());
                group_result = Err(err);
            }
        }
    }

    // Pop the whole group, deliver results, wake the next leader.
    for member in &group {
        let popped = state.writers.pop_front().expect("group member queued");
        debug_assert!(Arc::ptr_eq(&popped, member));
        if !Arc::ptr_eq(member, &me) {
            member.complete(group_result.clone());
        }
    }
    me.complete(group_result);
    inner.writers_cv.notify_all();
    drop(state);

    me.take_result()
}

/// Collect the leader's batch plus as many trailing compatible writers as
/// the size caps allow. `group` receives every participating handle in
/// queue order.
fn build_write_group(
    state:  &DbState,
    leader: &Arc<WriterHandle>,
    group:  &mut Vec<Arc<WriterHandle>>,
) -> WriteBatch {
    let leader_batch = leader.batch.as_ref().expect("leader has a batch");
    let mut merged = leader_batch.clone();

    // Don't balloon a tiny write's latency behind megabytes of followers.
    let max_bytes = if leader_batch.approximate_size() < SMALL_WRITE_BYTES {
        SMALL_MERGED_WRITE_BYTES
    } else {
        MAX_MERGED_WRITE_BYTES
    };

    for follower in state.writers.iter().skip(1) {
        if follower.sync && !leader.sync {
            // A sync write must not piggyback on a non-sync commit.
            break;
        }
        let Some(follower_batch) = &follower.batch else {
            // Rotation requests run alone.
            break;
        };
        if merged.approximate_size() + follower_batch.approximate_size() > max_bytes {
            break;
        }
        merged.append(follower_batch);
        group.push(Arc::clone(follower));
    }
    merged
}

fn append_group(
    wal:    &mut LogWriter<Box<dyn strata_vfs::WritableFile>>,
    mem:    &MemTable,
    merged: &WriteBatch,
    sync:   bool,
) -> Result<()> {
    wal.add_record(merged.contents())?;
    if sync {
        wal.sync()?;
    }
    merged.insert_into(mem, merged.sequence())?;
    Ok(())
}

/// Ensure the memtable can take the next write: throttle on level-0
/// pressure, rotate to a fresh WAL and memtable when the buffer is full,
/// and block when compaction is behind. Returns the (re-acquired) guard
/// alongside the outcome, since the slowdown path releases the mutex.
fn make_room_for_write<'a>(
    inner:     &'a Arc<DbInner>,
    mut state: MutexGuard<'a, DbState>,
    mut force: bool,
) -> (MutexGuard<'a, DbState>, Result<()>) {
    let mut allow_delay = !force;

    loop {
        if inner.shutting_down.load(AtomicOrdering::Acquire) {
            return (state, Err(Error::io("database is shutting down")));
        }
        if let Some(err) = &state.bg_error {
            let err = err.clone();
            return (state, Err(err));
        }

        if allow_delay
            && state.versions.current().num_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
        {
            // Hand the CPU to compaction for a moment, once per write, so
            // a single write is delayed by at most one millisecond.
            allow_delay = false;
            drop(state);
            std::thread::sleep(std::time::Duration::from_millis(1));
            state = inner.state.lock();
            continue;
        }

        if !force
            && state.mem.approximate_memory_usage() <= inner.opts.write_buffer_size
        {
            return (state, Ok(()));
        }

        if state.imm.is_some() {
            // The previous rotation is still being flushed.
            inner.background_work_finished.wait(&mut state);
            continue;
        }

        if state.versions.current().num_files(0) >= L0_STOP_WRITES_TRIGGER {
            tracing::warn!("too many level-0 files; stalling writes");
            inner.background_work_finished.wait(&mut state);
            continue;
        }

        // Rotate: fresh WAL, fresh memtable, old one to the flusher.
        let new_log_number = state.versions.new_file_number();
        let path = DbFile::Log { number: new_log_number }.path_in(&inner.db_dir);
        let file = match inner.fs.create(&path) {
            Ok(file) => file,
            Err(err) => {
                state.versions.reuse_file_number(new_log_number);
                return (state, Err(err.into()));
            }
        };

        state.wal = Some(LogWriter::new(file));
        state.wal_number = new_log_number;

        let full_mem = std::mem::replace(&mut state.mem, MemTable::new(inner.icmp.clone()));
        state.imm = Some(full_mem);
        inner.has_imm.store(true, AtomicOrdering::Release);
        force = false;
        inner.maybe_schedule_compaction(&mut state);
    }
}
