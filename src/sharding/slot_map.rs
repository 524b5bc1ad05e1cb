use log::{info, trace, warn};
use std::{
    sync::{
        Condvar, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Instant,
};

/// Number of hash slots a Redis cluster splits its key space into.
pub const CLUSTER_HASH_SLOTS: usize = 16384;

/// Shard index meaning "unresolved".
pub const UNKNOWN_SHARD: usize = usize::MAX;

/// One contiguous run of slots owned by a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardInterval {
    pub slot_min: usize,
    pub slot_max: usize,
    pub shard: usize,
}

impl ShardInterval {
    pub fn new(slot_min: usize, slot_max: usize, shard: usize) -> Self {
        Self {
            slot_min,
            slot_max,
            shard,
        }
    }
}

/// Slot → shard routing table, readable without locking and re-mapped live
/// by discovery.
pub struct SlotMap {
    slot_to_shard: Vec<AtomicUsize>,
    initialized: AtomicBool,
    mutex: Mutex<()>,
    cv: Condvar,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMap {
    pub fn new() -> Self {
        Self {
            slot_to_shard: (0..CLUSTER_HASH_SLOTS)
                .map(|_| AtomicUsize::new(UNKNOWN_SHARD))
                .collect(),
            initialized: AtomicBool::new(false),
            mutex: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn shard_by_slot(&self, slot: usize) -> usize {
        debug_assert!(slot < CLUSTER_HASH_SLOTS);
        self.slot_to_shard[slot].load(Ordering::Relaxed)
    }

    /// Stores every interval into the table, last writer per slot winning.
    /// The first update flips the table to initialized and wakes waiters;
    /// that flip never reverts.
    pub fn update_slots(&self, intervals: &[ShardInterval]) {
        if cfg!(debug_assertions) {
            check_intervals(intervals);
        }
        let mut changed_slots = 0usize;
        for interval in intervals {
            trace!(
                "interval: slot_min={} slot_max={} shard={}",
                interval.slot_min, interval.slot_max, interval.shard
            );
            for slot in interval.slot_min..=interval.slot_max.min(CLUSTER_HASH_SLOTS - 1) {
                let prev = self.slot_to_shard[slot].swap(interval.shard, Ordering::Relaxed);
                if prev != interval.shard {
                    changed_slots += 1;
                }
            }
        }
        if changed_slots > 0 {
            info!("cluster slots were updated, shard was changed for {changed_slots} slot(s)");
        }

        if !self.initialized.swap(true, Ordering::SeqCst) {
            drop(self.mutex.lock().unwrap());
            self.cv.notify_all();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Blocks the calling thread until the first `update_slots` or the
    /// deadline. Returns whether the table is initialized.
    pub fn wait_initialized(&self, deadline: Instant) -> bool {
        let mut guard = self.mutex.lock().unwrap();
        loop {
            if self.is_initialized() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return self.is_initialized();
            }
            let (next_guard, timeout) = self.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = next_guard;
            if timeout.timed_out() {
                return self.is_initialized();
            }
        }
    }
}

/// Pure validation of an interval set: once the bounds of all intervals are
/// unioned and sorted, every interval's endpoints must coincide with two
/// neighboring bounds. Overlaps and partial covers fail the check. Warns
/// and reports; never mutates.
fn check_intervals(intervals: &[ShardInterval]) -> bool {
    let mut slot_bounds: Vec<usize> = Vec::with_capacity(intervals.len() * 2);
    for interval in intervals {
        if interval.shard == UNKNOWN_SHARD {
            continue;
        }
        slot_bounds.push(interval.slot_min);
        slot_bounds.push(interval.slot_max + 1);
    }
    slot_bounds.sort_unstable();
    slot_bounds.dedup();

    for interval in intervals {
        if interval.shard == UNKNOWN_SHARD {
            continue;
        }
        let idx = slot_bounds.partition_point(|bound| *bound < interval.slot_min);
        if idx + 1 >= slot_bounds.len()
            || slot_bounds[idx] != interval.slot_min
            || slot_bounds[idx + 1] != interval.slot_max + 1
        {
            warn!("wrong shard intervals: {intervals:?}");
            return false;
        }
    }
    true
}
