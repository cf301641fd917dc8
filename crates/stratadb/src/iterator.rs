use std::cmp::Ordering;
use std::sync::Arc;

use strata_sstable::{SeekableIterator, TableComparator as _, TableError, TableIter, TableResult};

use crate::config::READ_BYTES_PERIOD;
use crate::error::{Error, Result};
use crate::format::{
    append_internal_key, extract_user_key, InternalKeyComparator, ParsedInternalKey,
    SequenceNumber, ValueType, VALUE_TYPE_FOR_SEEK,
};
use crate::table_cache::TableCache;
use crate::version::{find_file, FileMetadata, Version};


/// A boxed internal iterator, the unit the merge works over.
pub(crate) type BoxedIter = Box<dyn SeekableIterator + Send>;

// ================================================================
//  Level-concatenating iterator
// ================================================================

/// Iterates a level >= 1 as one logical run: outer position is a file in
/// the level's sorted, disjoint file list; inner position is a table
/// iterator over that file.
pub(crate) struct LevelIter {
    icmp:        InternalKeyComparator,
    table_cache: Arc<TableCache>,
    files:       Vec<Arc<FileMetadata>>,
    /// `files.len()` when invalid.
    file_index:  usize,
    table_iter:  Option<TableIter>,
    status:      Option<TableError>,
}

impl LevelIter {
    pub(crate) fn new(
        icmp:        InternalKeyComparator,
        table_cache: Arc<TableCache>,
        files:       Vec<Arc<FileMetadata>>,
    ) -> Self {
        let file_index = files.len();
        Self { icmp, table_cache, files, file_index, table_iter: None, status: None }
    }

    fn open_current_file(&mut self) {
        if self.file_index >= self.files.len() {
            self.table_iter = None;
            return;
        }
        let file = &self.files[self.file_index];
        match self.table_cache.iter(file.number, file.file_size) {
            Ok(iter) => self.table_iter = Some(iter),
            Err(err) => {
                self.status = Some(TableError::corruption(err.to_string()));
                self.table_iter = None;
            }
        }
    }

    fn skip_forward(&mut self) {
        while !self.table_iter.as_ref().is_some_and(TableIter::valid) {
            if self.file_index + 1 >= self.files.len() {
                self.file_index = self.files.len();
                self.table_iter = None;
                return;
            }
            self.file_index += 1;
            self.open_current_file();
            if let Some(table_iter) = &mut self.table_iter {
                table_iter.seek_to_first();
            }
        }
    }

    fn skip_backward(&mut self) {
        while !self.table_iter.as_ref().is_some_and(TableIter::valid) {
            if self.file_index == 0 || self.files.is_empty() {
                self.file_index = self.files.len();
                self.table_iter = None;
                return;
            }
            self.file_index -= 1;
            self.open_current_file();
            if let Some(table_iter) = &mut self.table_iter {
                table_iter.seek_to_last();
            }
        }
    }
}

impl SeekableIterator for LevelIter {
    fn valid(&self) -> bool {
        self.status.is_none() && self.table_iter.as_ref().is_some_and(TableIter::valid)
    }

    fn seek_to_first(&mut self) {
        self.file_index = 0;
        self.open_current_file();
        if let Some(table_iter) = &mut self.table_iter {
            table_iter.seek_to_first();
        }
        self.skip_forward();
    }

    fn seek_to_last(&mut self) {
        if self.files.is_empty() {
            return;
        }
        self.file_index = self.files.len() - 1;
        self.open_current_file();
        if let Some(table_iter) = &mut self.table_iter {
            table_iter.seek_to_last();
        }
        self.skip_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.file_index = find_file(&self.icmp, &self.files, target);
        self.open_current_file();
        if let Some(table_iter) = &mut self.table_iter {
            table_iter.seek(target);
        }
        self.skip_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(table_iter) = &mut self.table_iter {
            table_iter.next();
        }
        self.skip_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(table_iter) = &mut self.table_iter {
            table_iter.prev();
        }
        self.skip_backward();
    }

    fn key(&self) -> &[u8] {
        self.table_iter.as_ref().expect("key() on invalid iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.table_iter.as_ref().expect("value() on invalid iterator").value()
    }

    fn status(&self) -> TableResult<()> {
        if let Some(err) = &self.status {
            return Err(err.clone());
        }
        if let Some(table_iter) = &self.table_iter {
            table_iter.status()?;
        }
        Ok(())
    }
}

// ================================================================
//  Merging iterator
// ================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges N child iterators into one stream ordered by internal key.
///
/// The child count is small (memtables plus level-0 files plus one run per
/// deeper level), so the smallest child is found by linear scan rather than
/// a heap.
pub(crate) struct MergingIter {
    icmp:      InternalKeyComparator,
    children:  Vec<BoxedIter>,
    current:   Option<usize>,
    direction: Direction,
}

impl MergingIter {
    pub(crate) fn new(icmp: InternalKeyComparator, children: Vec<BoxedIter>) -> Self {
        Self { icmp, children, current: None, direction: Direction::Forward }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (index, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            smallest = match smallest {
                None => Some(index),
                Some(best)
                    if self.icmp.cmp(child.key(), self.children[best].key())
                        == Ordering::Less =>
                {
                    Some(index)
                }
                keep => keep,
            };
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (index, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            largest = match largest {
                None => Some(index),
                Some(best)
                    if self.icmp.cmp(child.key(), self.children[best].key())
                        == Ordering::Greater =>
                {
                    Some(index)
                }
                keep => keep,
            };
        }
        self.current = largest;
    }
}

impl SeekableIterator for MergingIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        let current = self.current.expect("next() on invalid iterator");

        if self.direction != Direction::Forward {
            // The other children sit before the current key; bring each to
            // the first entry after it.
            let key = self.children[current].key().to_vec();
            for (index, child) in self.children.iter_mut().enumerate() {
                if index == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() && self.icmp.cmp(&key, child.key()) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let current = self.current.expect("prev() on invalid iterator");

        if self.direction != Direction::Reverse {
            // Bring every other child to the last entry before the current
            // key.
            let key = self.children[current].key().to_vec();
            for (index, child) in self.children.iter_mut().enumerate() {
                if index == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    // Child is at the first entry >= key; step back.
                    child.prev();
                } else {
                    // Everything in the child is < key.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        let current = self.current.expect("key() on invalid iterator");
        self.children[current].key()
    }

    fn value(&self) -> &[u8] {
        let current = self.current.expect("value() on invalid iterator");
        self.children[current].value()
    }

    fn status(&self) -> TableResult<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

// ================================================================
//  The public database iterator
// ================================================================

/// Drives iterator read-sampling back into the compaction scheduler.
pub(crate) type SeekCompactionTrigger = Box<dyn Fn() + Send>;

/// The iterator handed to users: walks user keys in comparator order,
/// exposing for each the newest value visible at the iterator's sequence,
/// and hiding tombstoned keys.
pub struct DbIter {
    icmp:     InternalKeyComparator,
    internal: MergingIter,
    sequence: SequenceNumber,

    /// The version the iterator reads; sampled for seek-compaction.
    version:        Arc<Version>,
    sample_trigger: SeekCompactionTrigger,
    bytes_until_sample: u64,

    valid:     bool,
    direction: Direction,
    /// When moving forward: the current user key (to skip older dups).
    /// When moving backward: the entry to surface.
    saved_key:   Vec<u8>,
    saved_value: Vec<u8>,
    status:      Option<Error>,
}

impl DbIter {
    pub(crate) fn new(
        icmp:           InternalKeyComparator,
        internal:       MergingIter,
        sequence:       SequenceNumber,
        version:        Arc<Version>,
        sample_trigger: SeekCompactionTrigger,
    ) -> Self {
        Self {
            icmp,
            internal,
            sequence,
            version,
            sample_trigger,
            bytes_until_sample: READ_BYTES_PERIOD,
            valid: false,
            direction: Direction::Forward,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            status: None,
        }
    }

    /// Whether the iterator is positioned at an entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid && self.status.is_none()
    }

    /// The current user key. Only while [`valid`](Self::valid).
    #[must_use]
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        match self.direction {
            Direction::Forward => extract_user_key(self.internal.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    /// The current value. Only while [`valid`](Self::valid).
    #[must_use]
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        match self.direction {
            Direction::Forward => self.internal.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    /// Any error the iterator has run into (corrupt block, failed read).
    pub fn status(&self) -> Result<()> {
        if let Some(err) = &self.status {
            return Err(err.clone());
        }
        self.internal.status().map_err(Into::into)
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.internal.seek_to_first();
        if self.internal.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.internal.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Position at the first user key `>=` `user_key`.
    pub fn seek(&mut self, user_key: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        append_internal_key(
            &mut self.saved_key,
            user_key,
            self.sequence,
            VALUE_TYPE_FOR_SEEK,
        );
        self.internal.seek(&self.saved_key);
        if self.internal.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());

        if self.direction == Direction::Reverse {
            // `saved_key` is the entry being surfaced; the internal iterator
            // sits just before it. Move to the first internal entry at or
            // after the saved key.
            self.direction = Direction::Forward;
            if self.internal.valid() {
                // From the entry just before the surfaced key's cluster into
                // the cluster itself.
                self.internal.next();
            } else {
                // The surfaced key's entries are the first in the database.
                self.internal.seek_to_first();
            }
            if !self.internal.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // Fall through: skip remaining entries of the saved user key.
            self.temporarily_save_current_key();
        } else {
            self.temporarily_save_current_key();
            self.internal.next();
            if !self.internal.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid());

        if self.direction == Direction::Forward {
            // The internal iterator is at the current entry; back it up past
            // every entry of the current user key.
            self.temporarily_save_current_key();
            loop {
                self.internal.prev();
                if !self.internal.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .icmp
                    .user
                    .cmp(extract_user_key(self.internal.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    /// Stash the current entry's user key in `saved_key`.
    fn temporarily_save_current_key(&mut self) {
        self.sample_read_bytes();
        self.saved_key.clear();
        self.saved_key
            .extend_from_slice(extract_user_key(self.internal.key()));
    }

    /// Forward scan to the newest visible, non-deleted entry of the next
    /// user key. When `skipping`, entries for user keys `<= saved_key` are
    /// passed over.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);

        loop {
            if !self.internal.valid() {
                break;
            }
            self.sample_read_bytes();

            let Ok(parsed) = ParsedInternalKey::decode(self.internal.key()) else {
                self.status = Some(Error::corruption("corrupted internal key in iteration"));
                break;
            };

            if parsed.sequence <= self.sequence {
                match parsed.value_type {
                    ValueType::Deletion => {
                        // Every older entry of this user key is shadowed.
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(parsed.user_key);
                        skipping = true;
                    }
                    ValueType::Value => {
                        let behind = skipping
                            && self.icmp.user.cmp(parsed.user_key, &self.saved_key)
                                != Ordering::Greater;
                        if !behind {
                            self.saved_key.clear();
                            self.valid = true;
                            return;
                        }
                    }
                }
            }
            self.internal.next();
        }

        self.saved_key.clear();
        self.valid = false;
    }

    /// Backward scan: leaves `saved_key`/`saved_value` holding the newest
    /// visible value of the previous user key, and the internal iterator on
    /// the entry before that key's entries.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        // What we know about the entry we're about to surface.
        let mut value_type = ValueType::Deletion;

        while self.internal.valid() {
            self.sample_read_bytes();

            let Ok(parsed) = ParsedInternalKey::decode(self.internal.key()) else {
                self.status = Some(Error::corruption("corrupted internal key in iteration"));
                self.valid = false;
                return;
            };

            if parsed.sequence <= self.sequence {
                if value_type != ValueType::Deletion
                    && self.icmp.user.cmp(parsed.user_key, &self.saved_key) == Ordering::Less
                {
                    // We stepped into the previous user key with a surfaced
                    // value in hand; stop just before it.
                    break;
                }
                value_type = parsed.value_type;
                match value_type {
                    ValueType::Deletion => {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    }
                    ValueType::Value => {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(parsed.user_key);
                        self.saved_value.clear();
                        self.saved_value.extend_from_slice(self.internal.value());
                    }
                }
            }
            self.internal.prev();
        }

        if value_type == ValueType::Deletion {
            // Ran off the front.
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }

    /// Periodically bill iteration bytes against the file that served them,
    /// arming seek-triggered compaction for files read too often.
    fn sample_read_bytes(&mut self) {
        let entry_bytes = (self.internal.key().len() + self.internal.value().len()) as u64;
        if self.bytes_until_sample > entry_bytes {
            self.bytes_until_sample -= entry_bytes;
            return;
        }
        self.bytes_until_sample = READ_BYTES_PERIOD;
        if self.version.record_read_sample(self.internal.key()) {
            (self.sample_trigger)();
        }
    }
}

impl std::fmt::Debug for DbIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIter")
            .field("sequence", &self.sequence)
            .field("valid", &self.valid)
            .finish_non_exhaustive()
    }
}
