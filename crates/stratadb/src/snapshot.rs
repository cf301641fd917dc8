use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::format::SequenceNumber;


/// A read view pinned at the sequence number current when it was taken.
///
/// Reads through a snapshot see exactly the writes with sequence numbers at
/// or below it, and compaction will not drop entries a live snapshot can
/// still observe. Dropping the handle releases the snapshot; an explicit
/// [`Database::release_snapshot`] exists for symmetry with `get_snapshot`.
///
/// [`Database::release_snapshot`]: crate::Database::release_snapshot
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

struct SnapshotInner {
    sequence: SequenceNumber,
}

impl Snapshot {
    pub(crate) fn sequence(&self) -> SequenceNumber {
        self.inner.sequence
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Snapshot").field(&self.inner.sequence).finish()
    }
}

/// The registry of live snapshots, consulted by compaction for the smallest
/// sequence any reader may still need.
///
/// Registration hands out strong handles and keeps weak ones: a dropped
/// handle unregisters itself lazily, so release is O(1) and pruning is
/// amortized over later operations.
#[derive(Default)]
pub(crate) struct SnapshotList {
    snapshots: Mutex<Vec<Weak<SnapshotInner>>>,
}

impl SnapshotList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(&self, sequence: SequenceNumber) -> Snapshot {
        let inner = Arc::new(SnapshotInner { sequence });
        let mut snapshots = self.snapshots.lock();
        snapshots.retain(|weak| weak.strong_count() > 0);
        snapshots.push(Arc::downgrade(&inner));
        Snapshot { inner }
    }

    /// The smallest live snapshot sequence, if any snapshot is live.
    pub(crate) fn smallest(&self) -> Option<SequenceNumber> {
        let mut snapshots = self.snapshots.lock();
        snapshots.retain(|weak| weak.strong_count() > 0);
        snapshots
            .iter()
            .filter_map(Weak::upgrade)
            .map(|snapshot| snapshot.sequence)
            .min()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.smallest().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn smallest_tracks_live_snapshots() {
        let list = SnapshotList::new();
        assert!(list.is_empty());

        let s10 = list.acquire(10);
        let s5 = list.acquire(5);
        let s20 = list.acquire(20);
        assert_eq!(list.smallest(), Some(5));

        drop(s5);
        assert_eq!(list.smallest(), Some(10));

        drop(s10);
        drop(s20);
        assert!(list.is_empty());
    }

    #[test]
    fn clones_keep_a_snapshot_alive() {
        let list = SnapshotList::new();
        let original = list.acquire(7);
        let clone = original.clone();

        drop(original);
        assert_eq!(list.smallest(), Some(7));
        assert_eq!(clone.sequence(), 7);

        drop(clone);
        assert!(list.is_empty());
    }
}
