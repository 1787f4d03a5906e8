//! Runtime queue of pending and running station windows.
//!
//! Fixed capacity, no allocation after construction. Each station has at
//! most one live entry; `station_qid` is the per-station back-index into the
//! queue (`QID_NONE` when not queued) and is repaired on every removal so it
//! never dangles across queue compaction.

use tracing::warn;

/// Queue capacity. Entries offered beyond this are dropped (and counted).
pub const MAX_NQ: usize = 64;

/// Number of sequential groups.
pub const NUM_SEQ_GROUPS: usize = 4;

/// Back-index sentinel: station has no queue entry.
pub const QID_NONE: u8 = 0xFF;

/// Program-id tag for manually started runs.
pub const PID_MANUAL: u8 = 254;

/// Entries tagged with a pid at or above this are manual-style and exempt
/// from dynamic-event overrides.
pub const PID_MANUAL_FLOOR: u8 = 99;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueEntry {
    pub sid: usize,
    /// 1-based program id; `PID_MANUAL` for manual starts.
    pub pid: u8,
    /// Run length in seconds. Zero marks a tombstone awaiting collection.
    pub dur: i64,
    /// Absolute start time; zero while unscheduled.
    pub st: i64,
    /// Absolute removal time, at or after `st + dur`.
    pub deque_time: i64,
}

impl QueueEntry {
    pub fn end(&self) -> i64 {
        self.st + self.dur
    }
}

/// Completed-run record, the source of the station log line.
#[derive(Debug, Clone, Copy)]
pub struct LastRun {
    pub sid: usize,
    pub pid: u8,
    pub duration: i64,
    pub end_time: i64,
}

pub struct RuntimeQueue {
    entries: Vec<QueueEntry>,
    /// Back-index per station into `entries`.
    pub station_qid: Vec<u8>,
    /// Per-group stop-time anchor: latest `st + dur + station_delay` of any
    /// future-stopping sequential entry, zero when the group is idle.
    pub last_seq_stop_times: [i64; NUM_SEQ_GROUPS],
    pub lastrun: Option<LastRun>,
    pub pause_state: bool,
    pub pause_timer: i64,
    /// Entries dropped because the queue was full.
    pub dropped: u64,
}

impl RuntimeQueue {
    pub fn new(nstations: usize) -> Self {
        Self {
            entries: Vec::with_capacity(MAX_NQ),
            station_qid: vec![QID_NONE; nstations],
            last_seq_stop_times: [0; NUM_SEQ_GROUPS],
            lastrun: None,
            pause_state: false,
            pause_timer: 0,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn get(&self, qid: usize) -> Option<&QueueEntry> {
        self.entries.get(qid)
    }

    pub fn get_mut(&mut self, qid: usize) -> Option<&mut QueueEntry> {
        self.entries.get_mut(qid)
    }

    /// Queue entry currently bound to `sid`, if any.
    pub fn entry_for(&self, sid: usize) -> Option<&QueueEntry> {
        let qid = *self.station_qid.get(sid)?;
        if qid == QID_NONE {
            return None;
        }
        self.entries.get(qid as usize)
    }

    /// Append a new entry. Returns `None` (and counts the drop) when full.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Option<usize> {
        if self.entries.len() >= MAX_NQ {
            self.dropped += 1;
            warn!(sid = entry.sid, pid = entry.pid, "runtime queue full, dropping run");
            return None;
        }
        self.entries.push(entry);
        Some(self.entries.len() - 1)
    }

    /// Remove the entry at `qid`, preserving order, and repair every
    /// back-index that pointed at or beyond it.
    pub fn dequeue(&mut self, qid: usize) {
        if qid >= self.entries.len() {
            return;
        }
        self.entries.remove(qid);
        for slot in self.station_qid.iter_mut() {
            if *slot == QID_NONE {
                continue;
            }
            match (*slot as usize).cmp(&qid) {
                std::cmp::Ordering::Equal => *slot = QID_NONE,
                std::cmp::Ordering::Greater => *slot -= 1,
                std::cmp::Ordering::Less => {}
            }
        }
    }

    /// Drop all entries and bindings; group anchors go idle.
    pub fn reset_runtime(&mut self) {
        self.entries.clear();
        self.station_qid.fill(QID_NONE);
        self.last_seq_stop_times = [0; NUM_SEQ_GROUPS];
    }

    pub fn set_pause(&mut self, secs: i64) {
        self.pause_state = true;
        self.pause_timer = secs;
    }

    pub fn clear_pause(&mut self) {
        self.pause_state = false;
        self.pause_timer = 0;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sid: usize, dur: i64) -> QueueEntry {
        QueueEntry {
            sid,
            pid: 1,
            dur,
            st: 0,
            deque_time: 0,
        }
    }

    // -- enqueue ------------------------------------------------------------

    #[test]
    fn enqueue_returns_slot_index() {
        let mut q = RuntimeQueue::new(8);
        assert_eq!(q.enqueue(entry(0, 60)), Some(0));
        assert_eq!(q.enqueue(entry(1, 30)), Some(1));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn enqueue_full_drops_and_counts() {
        let mut q = RuntimeQueue::new(MAX_NQ + 8);
        for sid in 0..MAX_NQ {
            assert!(q.enqueue(entry(sid, 10)).is_some());
        }
        assert_eq!(q.enqueue(entry(MAX_NQ, 10)), None);
        assert_eq!(q.enqueue(entry(MAX_NQ + 1, 10)), None);
        assert_eq!(q.len(), MAX_NQ);
        assert_eq!(q.dropped, 2);
    }

    // -- dequeue + back-index repair ----------------------------------------

    #[test]
    fn dequeue_clears_matching_back_index() {
        let mut q = RuntimeQueue::new(8);
        q.enqueue(entry(3, 60));
        q.station_qid[3] = 0;
        q.dequeue(0);
        assert_eq!(q.station_qid[3], QID_NONE);
        assert!(q.is_empty());
    }

    #[test]
    fn dequeue_shifts_later_back_indices() {
        let mut q = RuntimeQueue::new(8);
        q.enqueue(entry(0, 60));
        q.enqueue(entry(1, 60));
        q.enqueue(entry(2, 60));
        q.station_qid[0] = 0;
        q.station_qid[1] = 1;
        q.station_qid[2] = 2;

        q.dequeue(1);

        assert_eq!(q.station_qid[0], 0);
        assert_eq!(q.station_qid[1], QID_NONE);
        assert_eq!(q.station_qid[2], 1);
        assert_eq!(q.entry_for(2).unwrap().sid, 2);
    }

    #[test]
    fn dequeue_out_of_range_is_noop() {
        let mut q = RuntimeQueue::new(8);
        q.enqueue(entry(0, 60));
        q.dequeue(5);
        assert_eq!(q.len(), 1);
    }

    /// After any sequence of queue operations, every bound back-index must
    /// point at an entry for its own station.
    #[test]
    fn back_index_never_dangles() {
        let mut q = RuntimeQueue::new(16);
        for sid in 0..10 {
            let qid = q.enqueue(entry(sid, 60)).unwrap();
            q.station_qid[sid] = qid as u8;
        }
        // Remove from the middle, the front, and the back.
        for qid in [4, 0, 7, 2, 0] {
            q.dequeue(qid);
            for sid in 0..16 {
                if let Some(e) = q.entry_for(sid) {
                    assert_eq!(e.sid, sid, "back-index dangles for station {sid}");
                }
            }
        }
    }

    // -- reset / pause ------------------------------------------------------

    #[test]
    fn reset_runtime_clears_everything() {
        let mut q = RuntimeQueue::new(8);
        q.enqueue(entry(0, 60));
        q.station_qid[0] = 0;
        q.last_seq_stop_times[0] = 1234;
        q.reset_runtime();
        assert!(q.is_empty());
        assert_eq!(q.station_qid[0], QID_NONE);
        assert_eq!(q.last_seq_stop_times[0], 0);
    }

    #[test]
    fn pause_set_and_clear() {
        let mut q = RuntimeQueue::new(8);
        q.set_pause(300);
        assert!(q.pause_state);
        assert_eq!(q.pause_timer, 300);
        q.clear_pause();
        assert!(!q.pause_state);
        assert_eq!(q.pause_timer, 0);
    }

    // -- Property: back-index integrity under arbitrary churn ----------------

    use proptest::prelude::*;

    proptest! {
        /// For any interleaving of enqueues and removals, a bound
        /// back-index always points at an entry for its own station.
        #[test]
        fn back_index_consistent_under_arbitrary_ops(
            ops in proptest::collection::vec((0usize..8, proptest::bool::ANY), 1..60),
        ) {
            let mut q = RuntimeQueue::new(8);
            for (sid, insert) in ops {
                if insert {
                    if let Some(qid) = q.enqueue(entry(sid, 10)) {
                        q.station_qid[sid] = qid as u8;
                    }
                } else if !q.is_empty() {
                    q.dequeue(sid % q.len());
                }
                for s in 0..8 {
                    if let Some(e) = q.entry_for(s) {
                        prop_assert_eq!(e.sid, s);
                    }
                }
            }
        }
    }
}
