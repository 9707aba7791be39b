//! The in-memory log window shared between the Raft core and its replication streams.
//!
//! The window holds every entry between the local snapshot boundary and the head of the log as
//! `Arc` handles. Entries appended together form a batch; replication acquires entry ranges
//! before handing them to the transport, which pins the covering batches until the send
//! completes. Truncation over a pinned range fails with [`LogError::LogBusy`] instead of
//! invalidating in-flight IO.

use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::error::LogError;
use crate::raft::Entry;
use crate::AppData;
use crate::LogId;

/// A contiguous run of entries appended in one call.
#[derive(Debug)]
struct Batch {
    /// Index of the first entry of the batch.
    first_index: u64,
    /// Number of entries remaining in the batch.
    len: u64,
    /// Number of acquisitions currently pinning this batch.
    acquires: u32,
}

impl Batch {
    fn last_index(&self) -> u64 {
        self.first_index + self.len - 1
    }

    fn overlaps(&self, from: u64, to: u64) -> bool {
        self.first_index <= to && from <= self.last_index()
    }
}

/// The in-memory log of a Raft node.
pub struct RaftLog<D: AppData> {
    /// The id of the last entry covered by the local snapshot.
    ///
    /// Truncation never reaches at or below this index. A trailing window of entries behind it
    /// may stay resident after compaction to serve lagging followers.
    snapshot_last_log_id: LogId,
    /// The index of the entry immediately preceding `entries[0]`; nothing at or below it is
    /// retrievable.
    offset: u64,
    entries: VecDeque<Arc<Entry<D>>>,
    batches: VecDeque<Batch>,
}

impl<D: AppData> RaftLog<D> {
    /// Create a log whose window starts just after the given snapshot boundary.
    pub fn new(snapshot_last_log_id: LogId) -> Self {
        Self {
            snapshot_last_log_id,
            offset: snapshot_last_log_id.index,
            entries: VecDeque::new(),
            batches: VecDeque::new(),
        }
    }

    /// The id of the last in-memory entry, or the snapshot boundary when the window is empty.
    pub fn last_log_id(&self) -> LogId {
        match self.entries.back() {
            Some(entry) => entry.log_id,
            None => self.snapshot_last_log_id,
        }
    }

    pub fn last_index(&self) -> u64 {
        self.offset + self.entries.len() as u64
    }

    /// The id of the last entry folded into the local snapshot.
    pub fn snapshot_last_log_id(&self) -> LogId {
        self.snapshot_last_log_id
    }

    /// Get the entry at the given index, if it is inside the window.
    pub fn get(&self, index: u64) -> Option<Arc<Entry<D>>> {
        if index <= self.offset || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.offset - 1) as usize).cloned()
    }

    /// The term of the entry at the given index.
    ///
    /// The snapshot boundary itself is answerable; anything below it has been compacted away
    /// and anything above the head of the log is unknown, both reported as `None`.
    pub fn term_of(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last_log_id.index {
            return Some(self.snapshot_last_log_id.term);
        }
        self.get(index).map(|entry| entry.log_id.term)
    }

    /// Check whether the entry at the given index has been folded into the snapshot.
    pub fn is_compacted(&self, index: u64) -> bool {
        index < self.snapshot_last_log_id.index
    }

    /// Append a single entry, forming a batch of one.
    pub fn append(&mut self, entry: Entry<D>) -> Arc<Entry<D>> {
        let handle = Arc::new(entry);
        self.batches.push_back(Batch {
            first_index: handle.log_id.index,
            len: 1,
            acquires: 0,
        });
        self.entries.push_back(handle.clone());
        handle
    }

    /// Append a run of entries sharing one batch.
    pub fn append_many(&mut self, entries: Vec<Entry<D>>) -> Vec<Arc<Entry<D>>> {
        if entries.is_empty() {
            return Vec::new();
        }
        self.batches.push_back(Batch {
            first_index: entries[0].log_id.index,
            len: entries.len() as u64,
            acquires: 0,
        });
        let handles: Vec<_> = entries.into_iter().map(Arc::new).collect();
        self.entries.extend(handles.iter().cloned());
        handles
    }

    /// Acquire the entries of the given range for IO, pinning the covering batches.
    ///
    /// The end of the range is clamped to the head of the log. Every successful acquire must be
    /// paired with a [`release`](Self::release) of the same range once the IO completes.
    pub fn acquire(&mut self, range: RangeInclusive<u64>) -> Result<Vec<Arc<Entry<D>>>, LogError> {
        let (from, to) = (*range.start(), (*range.end()).min(self.last_index()));
        if from <= self.offset {
            // Evicted from the window; the follower needs a snapshot instead.
            return Err(LogError::Compacted(from));
        }
        if from > self.last_index() {
            return Err(LogError::OutOfRange(from));
        }
        for batch in self.batches.iter_mut().filter(|b| b.overlaps(from, to)) {
            batch.acquires += 1;
        }
        let lo = (from - self.offset - 1) as usize;
        let hi = (to - self.offset) as usize;
        Ok(self.entries.iter().skip(lo).take(hi - lo).cloned().collect())
    }

    /// Release a previously acquired range.
    pub fn release(&mut self, range: RangeInclusive<u64>) {
        let (from, to) = (*range.start(), *range.end());
        for batch in self.batches.iter_mut().filter(|b| b.overlaps(from, to)) {
            batch.acquires = batch.acquires.saturating_sub(1);
        }
    }

    /// Drop all entries at and above `from`.
    ///
    /// Fails with [`LogError::LogBusy`] while any batch overlapping the range is acquired, and
    /// with [`LogError::Compacted`] when `from` reaches into the snapshot.
    pub fn truncate(&mut self, from: u64) -> Result<(), LogError> {
        if from <= self.snapshot_last_log_id.index {
            return Err(LogError::Compacted(from));
        }
        if from > self.last_index() {
            return Ok(());
        }
        let to = self.last_index();
        if self.batches.iter().any(|b| b.overlaps(from, to) && b.acquires > 0) {
            return Err(LogError::LogBusy(from));
        }
        self.drop_tail(from);
        Ok(())
    }

    /// Drop all entries at and above `from` without regard for pending IO.
    ///
    /// Used on failure paths where the dropped suffix was never submitted to storage.
    pub fn discard(&mut self, from: u64) {
        if from > self.last_index() || from <= self.offset {
            return;
        }
        self.drop_tail(from);
    }

    fn drop_tail(&mut self, from: u64) {
        self.entries.truncate((from - self.offset - 1) as usize);
        loop {
            let (first, last) = match self.batches.back() {
                Some(batch) => (batch.first_index, batch.last_index()),
                None => return,
            };
            if first >= from {
                self.batches.pop_back();
            } else {
                if last >= from {
                    if let Some(batch) = self.batches.back_mut() {
                        batch.len = from - batch.first_index;
                    }
                }
                return;
            }
        }
    }

    /// Advance the snapshot boundary after a local snapshot has been persisted.
    ///
    /// Entries more than `trailing` positions behind the boundary are evicted from the window;
    /// the trailing window stays in memory so that slightly lagging followers can still be
    /// served without a snapshot install. Pinned batches are left in place.
    pub fn compact(&mut self, last_log_id: LogId, trailing: u64) {
        if last_log_id.index <= self.snapshot_last_log_id.index {
            return;
        }
        self.snapshot_last_log_id = last_log_id;
        let evict_to = last_log_id.index.saturating_sub(trailing);
        while let Some(batch) = self.batches.front() {
            if batch.last_index() > evict_to || batch.acquires > 0 {
                break;
            }
            self.entries.drain(..batch.len as usize);
            self.offset = batch.last_index();
            self.batches.pop_front();
        }
    }

    /// Adopt a foreign snapshot boundary, dropping every in-memory entry.
    pub fn restore(&mut self, last_log_id: LogId) {
        self.snapshot_last_log_id = last_log_id;
        self.offset = last_log_id.index;
        self.entries.clear();
        self.batches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::EntryPayload;
    use serde::Deserialize;
    use serde::Serialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Payload(u64);
    impl crate::AppData for Payload {}

    fn entry(term: u64, index: u64) -> Entry<Payload> {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Normal(crate::raft::EntryNormal { data: Payload(index) }),
        }
    }

    fn log_with(n: u64) -> RaftLog<Payload> {
        let mut log = RaftLog::new(LogId::default());
        for i in 1..=n {
            log.append(entry(1, i));
        }
        log
    }

    #[test]
    fn test_append_and_lookup() {
        let log = log_with(3);
        assert_eq!(log.last_log_id(), LogId::new(1, 3));
        assert_eq!(log.term_of(2), Some(1));
        assert_eq!(log.term_of(0), Some(0));
        assert_eq!(log.term_of(4), None);
        assert!(log.get(4).is_none());
    }

    #[test]
    fn test_acquire_then_truncate_is_rejected_until_release() {
        let mut log = log_with(5);
        let acquired = log.acquire(2..=4).expect("in range");
        assert_eq!(acquired.len(), 3);

        assert_eq!(log.truncate(3), Err(LogError::LogBusy(3)));

        log.release(2..=4);
        log.truncate(3).expect("released");
        assert_eq!(log.last_log_id(), LogId::new(1, 2));
    }

    #[test]
    fn test_overlapping_acquisitions_pin_independently() {
        let mut log = log_with(4);
        log.acquire(1..=2).expect("in range");
        log.acquire(2..=4).expect("in range");

        log.release(1..=2);
        // The second acquisition still pins entries 2..=4.
        assert_eq!(log.truncate(2), Err(LogError::LogBusy(2)));
        log.release(2..=4);
        log.truncate(2).expect("released");
    }

    #[test]
    fn test_truncate_at_snapshot_boundary() {
        let mut log = RaftLog::new(LogId::new(1, 10));
        log.append(entry(2, 11));
        log.append(entry(2, 12));

        // At or below the boundary is forbidden; exactly boundary + 1 is permitted.
        assert_eq!(log.truncate(10), Err(LogError::Compacted(10)));
        log.truncate(11).expect("just after the boundary");
        assert_eq!(log.last_log_id(), LogId::new(1, 10));
    }

    #[test]
    fn test_acquire_below_boundary_reports_compacted() {
        let mut log = RaftLog::new(LogId::new(1, 10));
        log.append(entry(2, 11));
        assert_eq!(log.acquire(5..=11).err(), Some(LogError::Compacted(5)));
        assert_eq!(log.acquire(12..=12).err(), Some(LogError::OutOfRange(12)));
    }

    #[test]
    fn test_compact_keeps_trailing_window() {
        let mut log = log_with(10);
        log.compact(LogId::new(1, 8), 2);
        assert_eq!(log.snapshot_last_log_id(), LogId::new(1, 8));
        // Entries 1..=6 are evicted, 7..=10 stay resident.
        assert!(log.get(6).is_none());
        assert!(log.get(7).is_some());
        assert_eq!(log.term_of(8), Some(1));
        assert_eq!(log.last_log_id(), LogId::new(1, 10));
    }

    #[test]
    fn test_restore_adopts_foreign_boundary() {
        let mut log = log_with(4);
        log.restore(LogId::new(3, 20));
        assert_eq!(log.last_log_id(), LogId::new(3, 20));
        assert_eq!(log.snapshot_last_log_id(), LogId::new(3, 20));
        assert!(log.get(3).is_none());
        let appended = log.append(entry(3, 21));
        assert_eq!(appended.log_id.index, 21);
    }

    #[test]
    fn test_batch_shared_by_append_many() {
        let mut log = RaftLog::new(LogId::default());
        log.append_many(vec![entry(1, 1), entry(1, 2), entry(1, 3)]);
        log.acquire(1..=1).expect("in range");
        // The acquisition pins the whole batch, not just the requested entry.
        assert_eq!(log.truncate(3), Err(LogError::LogBusy(3)));
        log.release(1..=1);
        log.truncate(3).expect("released");
    }
}
